//! Localized messages on the wire.
//!
//! User-visible text never crosses the network as raw strings from
//! untrusted peers: messages are (key, params) pairs that the client
//! resolves against its own language catalogue. Raw-string parameters are
//! only honoured on trusted links; on untrusted ones (replicated VM mode)
//! they are replaced with a fixed placeholder at decode time, so a
//! compromised leader cannot spoof localized messages.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::PlayerId;
use crate::{InputByteBuf, OutputByteBuf, ProtocolError};

/// Placeholder substituted for raw-string params from untrusted peers.
const UNTRUSTED_PLACEHOLDER: &str = "#####";

/// A key into the client's localization catalogue.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalKey(String);

impl LocalKey {
    pub fn new(key: impl Into<String>) -> Self {
        LocalKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for LocalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One parameter of a localized message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalParam {
    Key(LocalKey),
    Player(PlayerId),
    Int(i32),
    /// Raw text; replaced by a placeholder when received over an
    /// untrusted link.
    Text(String),
}

/// A localized message: key, plural count and parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMsg {
    pub key: LocalKey,
    pub count: u32,
    pub params: Vec<LocalParam>,
}

impl LocalMsg {
    pub fn new(key: &str) -> Self {
        LocalMsg {
            key: LocalKey::new(key),
            count: 0,
            params: Vec::new(),
        }
    }

    pub fn with_params(key: &str, params: Vec<LocalParam>) -> Self {
        LocalMsg {
            key: LocalKey::new(key),
            count: 0,
            params,
        }
    }
}

/// Serializes a localized message.
pub fn write_local_msg(buf: &mut OutputByteBuf<'_>, msg: &LocalMsg) {
    buf.write_string(msg.key.as_str());
    buf.write_var_int(msg.count);
    buf.write_ubyte(msg.params.len() as u8);
    for param in &msg.params {
        match param {
            LocalParam::Key(key) => {
                buf.write_ubyte(0);
                buf.write_string(key.as_str());
            }
            LocalParam::Player(id) => {
                buf.write_ubyte(1);
                buf.write_string(id.as_str());
            }
            LocalParam::Int(x) => {
                buf.write_ubyte(2);
                buf.write_var_int(*x as u32 & 0x0FFF_FFFF);
            }
            LocalParam::Text(s) => {
                buf.write_ubyte(3);
                buf.write_string(s);
            }
        }
    }
}

/// Deserializes a localized message. `allow_untrusted_strings` must be
/// false on links to unauthenticated peers.
pub fn read_local_msg(
    buf: &mut InputByteBuf<'_>,
    allow_untrusted_strings: bool,
) -> Result<LocalMsg, ProtocolError> {
    let key = LocalKey::new(buf.read_string()?);
    let count = buf.read_var_int()?;
    let num_params = buf.read_ubyte()? as usize;
    let mut params = Vec::with_capacity(num_params);
    for _ in 0..num_params {
        match buf.read_ubyte()? {
            0 => params.push(LocalParam::Key(LocalKey::new(buf.read_string()?))),
            1 => params.push(LocalParam::Player(PlayerId::new(buf.read_string()?))),
            2 => params.push(LocalParam::Int(buf.read_var_int()? as i32)),
            3 => {
                let s = buf.read_string()?;
                let s = if allow_untrusted_strings {
                    s
                } else {
                    UNTRUSTED_PLACEHOLDER.to_owned()
                };
                params.push(LocalParam::Text(s));
            }
            _ => return Err(ProtocolError::key("bad_server_message")),
        }
    }
    Ok(LocalMsg { key, count, params })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: &LocalMsg, trusted: bool) -> LocalMsg {
        let mut v = Vec::new();
        write_local_msg(&mut OutputByteBuf::new(&mut v), msg);
        read_local_msg(&mut InputByteBuf::new(&v), trusted).unwrap()
    }

    #[test]
    fn local_msg_round_trip() {
        let msg = LocalMsg {
            key: LocalKey::new("player_set_menu"),
            count: 2,
            params: vec![
                LocalParam::Player(PlayerId::new("alice")),
                LocalParam::Key(LocalKey::new("quest_title")),
                LocalParam::Int(3),
            ],
        };
        assert_eq!(round_trip(&msg, true), msg);
    }

    #[test]
    fn untrusted_text_is_replaced() {
        let msg = LocalMsg {
            key: LocalKey::new("lua_error_is"),
            count: 0,
            params: vec![LocalParam::Text("attempt to call nil".into())],
        };
        let decoded = round_trip(&msg, false);
        assert_eq!(decoded.params, vec![LocalParam::Text("#####".into())]);
        // but the trusted path keeps it
        assert_eq!(round_trip(&msg, true), msg);
    }
}
