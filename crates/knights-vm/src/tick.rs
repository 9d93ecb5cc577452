//! Tick-data codec.
//!
//! A tick frame is a length-encoded header (bit 0 = has-messages, upper
//! bits = tick duration in ms, clamped to 0–1000) followed by zero or
//! more message records. Each record starts with one byte: the high bit
//! chains to the next record, bits 3–6 hold the payload length (15 means
//! a separate length follows) and bits 0–2 the message kind. A one-byte
//! client number follows, then the payload. The last record is the one
//! whose high bit is clear; the finalizer pass clears that bit when the
//! frame is completed.

use crate::VmError;

/// Largest value the 1–3 byte length encoding can carry (and thus the
/// hard cap on a tick buffer's size).
pub const MAX_TICK_DATA_LENGTH: u32 = 0x3f_ffff;

/// Tick durations are clamped to this many milliseconds.
pub const MAX_TICK_MS: u32 = 1000;

// message kinds (3 bits)
const TM_NEW_CONNECTION: u8 = 0;
const TM_CLOSE_CONNECTION: u8 = 1;
const TM_CLIENT_SEND_DATA: u8 = 2;
const TM_CLIENT_PING_REPORT: u8 = 3;
const TM_SERVER_SEND_DATA: u8 = 4;
const TM_CLOSE_ALL_CONNECTIONS: u8 = 5;

/// Appends the 1–3 byte length encoding of `length` (7+7+8 bits, least
/// significant first, high bit = more bytes follow).
pub fn encode_length(vec: &mut Vec<u8>, length: u32) -> Result<(), VmError> {
    if length > MAX_TICK_DATA_LENGTH {
        return Err(VmError::TickFormat("length overflow"));
    }
    let mut x = (length & 0x7f) as u8;
    let mut y = ((length >> 7) & 0x7f) as u8;
    let z = ((length >> 14) & 0xff) as u8;
    if y != 0 || z != 0 {
        x |= 0x80;
    }
    if z != 0 {
        y |= 0x80;
    }
    vec.push(x);
    if x & 0x80 != 0 {
        vec.push(y);
    }
    if y & 0x80 != 0 {
        vec.push(z);
    }
    Ok(())
}

fn read_ubyte(data: &[u8], pos: &mut usize) -> Result<u8, VmError> {
    let b = *data
        .get(*pos)
        .ok_or(VmError::TickFormat("unexpected end of tick data"))?;
    *pos += 1;
    Ok(b)
}

/// Decodes a length written by [`encode_length`], advancing `pos`.
pub fn decode_length(data: &[u8], pos: &mut usize) -> Result<u32, VmError> {
    let x = read_ubyte(data, pos)?;
    let mut y = 0u8;
    let mut z = 0u8;
    if x & 0x80 != 0 {
        y = read_ubyte(data, pos)?;
        if y & 0x80 != 0 {
            z = read_ubyte(data, pos)?;
        }
    }
    Ok(((z as u32) << 14) | (((y & 0x7f) as u32) << 7) | ((x & 0x7f) as u32))
}

/// Receiver of decoded tick messages. All methods default to no-ops so
/// implementations only handle what they care about.
pub trait TickSink {
    /// A new tick begins; the VM clock advances by this much.
    fn on_new_tick(&mut self, _tick_duration_ms: u32) -> Result<(), VmError> {
        Ok(())
    }

    fn on_new_connection(&mut self, _client: u8, _platform_user_id: &str) -> Result<(), VmError> {
        Ok(())
    }

    fn on_close_connection(&mut self, _client: u8) -> Result<(), VmError> {
        Ok(())
    }

    fn on_close_all_connections(&mut self) -> Result<(), VmError> {
        Ok(())
    }

    fn on_client_send_data(&mut self, _client: u8, _data: &[u8]) -> Result<(), VmError> {
        Ok(())
    }

    fn on_client_ping_report(&mut self, _client: u8, _ping_ms: u16) -> Result<(), VmError> {
        Ok(())
    }

    fn on_server_send_data(&mut self, _client: u8, _data: &[u8]) -> Result<(), VmError> {
        Ok(())
    }
}

/// Interprets one tick frame, invoking the sink callbacks in stream
/// order. Returns the number of bytes consumed (0 if `data` is empty).
pub fn read_tick_data(data: &[u8], sink: &mut impl TickSink) -> Result<usize, VmError> {
    if data.is_empty() {
        return Ok(0);
    }
    let mut pos = 0usize;

    let header = decode_length(data, &mut pos)?;
    let mut more_messages = header & 1 != 0;
    let duration = header >> 1;
    if duration > MAX_TICK_MS {
        return Err(VmError::TickFormat("invalid tick duration"));
    }
    sink.on_new_tick(duration)?;

    while more_messages {
        let byte = read_ubyte(data, &mut pos)?;
        more_messages = byte & 0x80 != 0;
        let mut payload_length = ((byte >> 3) & 0x0f) as u32;
        let message_type = byte & 0x07;

        if payload_length == 0x0f {
            // length did not fit the header byte; it follows separately
            payload_length = decode_length(data, &mut pos)?;
        }

        // every message kind carries a client number
        let client = read_ubyte(data, &mut pos)?;

        let payload_end = pos + payload_length as usize;
        match message_type {
            TM_NEW_CONNECTION => {
                let bytes = data
                    .get(pos..payload_end)
                    .ok_or(VmError::TickFormat("unexpected end of tick data"))?;
                pos = payload_end;
                let user = std::str::from_utf8(bytes)
                    .map_err(|_| VmError::TickFormat("bad utf-8 in platform user id"))?;
                sink.on_new_connection(client, user)?;
            }
            TM_CLOSE_CONNECTION => sink.on_close_connection(client)?,
            TM_CLOSE_ALL_CONNECTIONS => sink.on_close_all_connections()?,
            TM_CLIENT_SEND_DATA | TM_SERVER_SEND_DATA => {
                let bytes = data
                    .get(pos..payload_end)
                    .ok_or(VmError::TickFormat("unexpected end of tick data"))?;
                pos = payload_end;
                if message_type == TM_CLIENT_SEND_DATA {
                    sink.on_client_send_data(client, bytes)?;
                } else {
                    sink.on_server_send_data(client, bytes)?;
                }
            }
            TM_CLIENT_PING_REPORT => {
                // the ping time rides in the payload-length slot
                sink.on_client_ping_report(client, payload_length.min(u16::MAX as u32) as u16)?;
            }
            _ => return Err(VmError::TickFormat("invalid tick message")),
        }
    }

    Ok(pos)
}

/// Runs [`read_tick_data`] until the buffer is exhausted.
pub fn read_all_ticks(data: &[u8], sink: &mut impl TickSink) -> Result<(), VmError> {
    let mut rest = data;
    while !rest.is_empty() {
        let consumed = read_tick_data(rest, sink)?;
        rest = &rest[consumed..];
    }
    Ok(())
}

/// Builds one tick frame.
///
/// Messages accumulate in the writer; `finalize_into` then emits the
/// duration header followed by the records, clearing the chain bit on the
/// final one. A frame must be finalized before it can be read.
#[derive(Debug, Default)]
pub struct TickWriter {
    msgs: Vec<u8>,
    last_msg_pos: Option<usize>,
}

impl TickWriter {
    pub fn new() -> Self {
        TickWriter::default()
    }

    /// True if at least one write method was called.
    pub fn was_message_written(&self) -> bool {
        self.last_msg_pos.is_some()
    }

    fn begin_message(
        &mut self,
        msg_type: u8,
        payload_length: u32,
        client: u8,
    ) -> Result<(), VmError> {
        if self.msgs.len() >= MAX_TICK_DATA_LENGTH as usize {
            return Err(VmError::TickFormat("tick data too long"));
        }

        self.last_msg_pos = Some(self.msgs.len());

        // chain bit set on the assumption that more messages follow;
        // finalize clears it on the last record
        let mut byte = 0x80 | msg_type;
        let long_payload = payload_length >= 15;
        if long_payload {
            byte |= 0x78;
        } else {
            byte |= (payload_length as u8) << 3;
        }
        self.msgs.push(byte);
        if long_payload {
            encode_length(&mut self.msgs, payload_length)?;
        }
        self.msgs.push(client);
        Ok(())
    }

    pub fn write_new_connection(&mut self, client: u8, platform_user_id: &str) -> Result<(), VmError> {
        self.begin_message(
            TM_NEW_CONNECTION,
            platform_user_id.len() as u32,
            client,
        )?;
        self.msgs.extend_from_slice(platform_user_id.as_bytes());
        Ok(())
    }

    pub fn write_close_connection(&mut self, client: u8) -> Result<(), VmError> {
        self.begin_message(TM_CLOSE_CONNECTION, 0, client)
    }

    pub fn write_close_all_connections(&mut self) -> Result<(), VmError> {
        self.begin_message(TM_CLOSE_ALL_CONNECTIONS, 0, 0)
    }

    pub fn write_client_send_data(&mut self, client: u8, data: &[u8]) -> Result<(), VmError> {
        self.begin_message(TM_CLIENT_SEND_DATA, data.len() as u32, client)?;
        self.msgs.extend_from_slice(data);
        Ok(())
    }

    pub fn write_client_ping_report(&mut self, client: u8, ping_ms: u16) -> Result<(), VmError> {
        self.begin_message(TM_CLIENT_PING_REPORT, ping_ms as u32, client)
    }

    pub fn write_server_send_data(&mut self, client: u8, data: &[u8]) -> Result<(), VmError> {
        self.begin_message(TM_SERVER_SEND_DATA, data.len() as u32, client)?;
        self.msgs.extend_from_slice(data);
        Ok(())
    }

    /// Completes the frame into `out`: clamps and writes the duration
    /// header, then the records with the final chain bit cleared.
    pub fn finalize_into(mut self, out: &mut Vec<u8>, tick_duration_ms: u32) -> Result<(), VmError> {
        let duration = tick_duration_ms.min(MAX_TICK_MS);

        if let Some(pos) = self.last_msg_pos {
            self.msgs[pos] ^= 0x80;
        }

        let has_messages = self.last_msg_pos.is_some() as u32;
        encode_length(out, (duration << 1) | has_messages)?;
        out.extend_from_slice(&self.msgs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl TickSink for Recorder {
        fn on_new_tick(&mut self, d: u32) -> Result<(), VmError> {
            self.events.push(format!("tick {d}"));
            Ok(())
        }
        fn on_new_connection(&mut self, c: u8, id: &str) -> Result<(), VmError> {
            self.events.push(format!("new {c} {id:?}"));
            Ok(())
        }
        fn on_close_connection(&mut self, c: u8) -> Result<(), VmError> {
            self.events.push(format!("close {c}"));
            Ok(())
        }
        fn on_close_all_connections(&mut self) -> Result<(), VmError> {
            self.events.push("close_all".into());
            Ok(())
        }
        fn on_client_send_data(&mut self, c: u8, data: &[u8]) -> Result<(), VmError> {
            self.events.push(format!("client {c} {data:?}"));
            Ok(())
        }
        fn on_client_ping_report(&mut self, c: u8, ping: u16) -> Result<(), VmError> {
            self.events.push(format!("ping {c} {ping}"));
            Ok(())
        }
        fn on_server_send_data(&mut self, c: u8, data: &[u8]) -> Result<(), VmError> {
            self.events.push(format!("server {c} {data:?}"));
            Ok(())
        }
    }

    #[test]
    fn length_codec_round_trip_over_full_range_boundaries() {
        for n in [0u32, 1, 0x7f, 0x80, 0x3fff, 0x4000, 0x12345, MAX_TICK_DATA_LENGTH] {
            let mut v = Vec::new();
            encode_length(&mut v, n).unwrap();
            let mut pos = 0;
            assert_eq!(decode_length(&v, &mut pos).unwrap(), n, "value {n:#x}");
            assert_eq!(pos, v.len());
        }
        let mut v = Vec::new();
        assert!(encode_length(&mut v, MAX_TICK_DATA_LENGTH + 1).is_err());
    }

    #[test]
    fn writer_reader_round_trip_in_order() {
        let mut data = Vec::new();
        let mut writer = TickWriter::new();
        writer.write_new_connection(0, "").unwrap();
        writer.write_client_send_data(0, &[0xAA, 0xBB]).unwrap();
        writer.write_client_ping_report(0, 42).unwrap();
        writer.finalize_into(&mut data, 17).unwrap();

        let mut rec = Recorder::default();
        let consumed = read_tick_data(&data, &mut rec).unwrap();
        assert_eq!(consumed, data.len());
        assert_eq!(
            rec.events,
            vec![
                "tick 17".to_string(),
                "new 0 \"\"".to_string(),
                "client 0 [170, 187]".to_string(),
                "ping 0 42".to_string(),
            ]
        );
    }

    #[test]
    fn empty_tick_has_no_messages() {
        let mut data = Vec::new();
        let writer = TickWriter::new();
        assert!(!writer.was_message_written());
        writer.finalize_into(&mut data, 250).unwrap();

        let mut rec = Recorder::default();
        read_tick_data(&data, &mut rec).unwrap();
        assert_eq!(rec.events, vec!["tick 250".to_string()]);
    }

    #[test]
    fn duration_is_clamped_to_one_second() {
        let mut data = Vec::new();
        TickWriter::new().finalize_into(&mut data, 90_000).unwrap();
        let mut rec = Recorder::default();
        read_tick_data(&data, &mut rec).unwrap();
        assert_eq!(rec.events, vec!["tick 1000".to_string()]);
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let mut data = Vec::new();
        let mut w = TickWriter::new();
        w.write_close_all_connections().unwrap();
        w.finalize_into(&mut data, 5).unwrap();
        let mut w = TickWriter::new();
        w.write_close_connection(3).unwrap();
        w.finalize_into(&mut data, 7).unwrap();

        let mut rec = Recorder::default();
        read_all_ticks(&data, &mut rec).unwrap();
        assert_eq!(
            rec.events,
            vec![
                "tick 5".to_string(),
                "close_all".to_string(),
                "tick 7".to_string(),
                "close 3".to_string(),
            ]
        );
    }

    #[test]
    fn long_payload_uses_separate_length() {
        let payload = vec![7u8; 300];
        let mut data = Vec::new();
        let mut w = TickWriter::new();
        w.write_client_send_data(1, &payload).unwrap();
        w.finalize_into(&mut data, 0).unwrap();

        let mut rec = Recorder::default();
        read_tick_data(&data, &mut rec).unwrap();
        assert_eq!(rec.events[1], format!("client 1 {payload:?}"));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let mut data = Vec::new();
        let mut w = TickWriter::new();
        w.write_client_send_data(0, &[1, 2, 3, 4]).unwrap();
        w.finalize_into(&mut data, 10).unwrap();
        data.truncate(data.len() - 2);

        let mut rec = Recorder::default();
        assert!(read_tick_data(&data, &mut rec).is_err());
    }
}
