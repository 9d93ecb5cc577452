//! Encoder for client-to-server messages.
//!
//! Collects outgoing commands into a byte buffer which the caller drains
//! and hands to the transport. Used by the host-migration lobby to replay
//! the local player's join sequence, and by tests to drive a server.

use crate::codes::client_msg;
use crate::types::{ControlByte, PlayerId};
use crate::{version_string, OutputByteBuf, PROTOCOL_VERSION};

/// Builds the client side of the wire protocol.
#[derive(Debug, Default)]
pub struct ClientCommands {
    out: Vec<u8>,
}

impl ClientCommands {
    pub fn new() -> Self {
        ClientCommands::default()
    }

    /// Takes all bytes queued so far, leaving the buffer empty.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    fn buf(&mut self) -> OutputByteBuf<'_> {
        OutputByteBuf::new(&mut self.out)
    }

    /// The version string, which must be the first thing sent.
    pub fn send_version(&mut self) {
        let s = version_string(PROTOCOL_VERSION);
        self.buf().write_string(&s);
    }

    pub fn set_player_id(&mut self, id: &PlayerId) {
        let mut buf = self.buf();
        buf.write_ubyte(client_msg::SET_PLAYER_ID);
        buf.write_string(id.as_str());
    }

    pub fn send_password(&mut self, password: &str) {
        let mut buf = self.buf();
        buf.write_ubyte(client_msg::SEND_PASSWORD);
        buf.write_string(password);
    }

    pub fn join_game(&mut self, game_name: &str) {
        let mut buf = self.buf();
        buf.write_ubyte(client_msg::JOIN_GAME);
        buf.write_string(game_name);
    }

    pub fn join_game_split_screen(&mut self, game_name: &str) {
        let mut buf = self.buf();
        buf.write_ubyte(client_msg::JOIN_GAME_SPLIT_SCREEN);
        buf.write_string(game_name);
    }

    pub fn leave_game(&mut self) {
        self.buf().write_ubyte(client_msg::LEAVE_GAME);
    }

    pub fn chat(&mut self, msg: &str) {
        let mut buf = self.buf();
        buf.write_ubyte(client_msg::CHAT);
        buf.write_string(msg);
    }

    pub fn set_ready(&mut self, ready: bool) {
        let mut buf = self.buf();
        buf.write_ubyte(client_msg::SET_READY);
        buf.write_ubyte(ready as u8);
    }

    pub fn set_house_colour(&mut self, col: u8) {
        let mut buf = self.buf();
        buf.write_ubyte(client_msg::SET_HOUSE_COLOUR);
        buf.write_ubyte(col);
    }

    pub fn set_menu_selection(&mut self, item: u32, choice: u32) {
        let mut buf = self.buf();
        buf.write_ubyte(client_msg::SET_MENU_SELECTION);
        buf.write_var_int(item);
        buf.write_var_int(choice);
    }

    pub fn random_quest(&mut self) {
        self.buf().write_ubyte(client_msg::RANDOM_QUEST);
    }

    pub fn finished_loading(&mut self) {
        self.buf().write_ubyte(client_msg::FINISHED_LOADING);
    }

    pub fn send_control(&mut self, control: ControlByte) {
        let mut buf = self.buf();
        buf.write_ubyte(client_msg::SEND_CONTROL);
        buf.write_ubyte(control.encode());
    }

    pub fn ready_to_end(&mut self) {
        self.buf().write_ubyte(client_msg::READY_TO_END);
    }

    pub fn set_pause_mode(&mut self, paused: bool) {
        let mut buf = self.buf();
        buf.write_ubyte(client_msg::SET_PAUSE_MODE);
        buf.write_ubyte(paused as u8);
    }

    pub fn set_obs_flag(&mut self, obs: bool) {
        let mut buf = self.buf();
        buf.write_ubyte(client_msg::SET_OBS_FLAG);
        buf.write_ubyte(obs as u8);
    }

    pub fn request_speech_bubble(&mut self, show: bool) {
        let mut buf = self.buf();
        buf.write_ubyte(client_msg::REQUEST_SPEECH_BUBBLE);
        buf.write_ubyte(show as u8);
    }

    pub fn set_approach_based_controls(&mut self, flag: bool) {
        let mut buf = self.buf();
        buf.write_ubyte(client_msg::SET_APPROACH_BASED_CONTROLS);
        buf.write_ubyte(flag as u8);
    }

    pub fn set_action_bar_controls(&mut self, flag: bool) {
        let mut buf = self.buf();
        buf.write_ubyte(client_msg::SET_ACTION_BAR_CONTROLS);
        buf.write_ubyte(flag as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InputByteBuf;

    #[test]
    fn version_then_player_id() {
        let mut client = ClientCommands::new();
        client.send_version();
        client.set_player_id(&PlayerId::new("alice"));
        let bytes = client.take_output();
        assert!(client.is_empty());

        let mut r = InputByteBuf::new(&bytes);
        assert_eq!(r.read_string().unwrap(), "Knights/018");
        assert_eq!(r.read_ubyte().unwrap(), client_msg::SET_PLAYER_ID);
        assert_eq!(r.read_string().unwrap(), "alice");
        assert!(r.eof());
    }
}
