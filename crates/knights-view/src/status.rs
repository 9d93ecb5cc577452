//! Status-display encoder: stateless passthrough to wire bytes.

use knights_engine::PotionMagic;
use knights_protocol::{ext_msg, server_msg, write_local_msg, LocalMsg, OutputByteBuf};

pub fn set_backpack(out: &mut Vec<u8>, slot: u8, gfx: u32, overdraw: u32, carried: u8, max: u8) {
    let mut buf = OutputByteBuf::new(out);
    buf.write_ubyte(server_msg::SET_BACKPACK);
    buf.write_ubyte(slot);
    buf.write_var_int(gfx);
    buf.write_var_int(overdraw);
    buf.write_ubyte(carried);
    buf.write_ubyte(max);
}

pub fn add_skull(out: &mut Vec<u8>) {
    out.push(server_msg::ADD_SKULL);
}

pub fn set_health(out: &mut Vec<u8>, health: u32) {
    let mut buf = OutputByteBuf::new(out);
    buf.write_ubyte(server_msg::SET_HEALTH);
    buf.write_var_int(health);
}

pub fn set_potion_magic(out: &mut Vec<u8>, pm: PotionMagic, poison_immunity: bool) {
    let mut buf = OutputByteBuf::new(out);
    buf.write_ubyte(server_msg::SET_POTION_MAGIC);
    buf.write_ubyte(if poison_immunity { 128 } else { 0 } + pm as u8);
}

/// Quest hints travel as an extended message so old clients skip them.
pub fn set_quest_hints(out: &mut Vec<u8>, hints: &[LocalMsg]) {
    let mut buf = OutputByteBuf::new(out);
    buf.write_ubyte(server_msg::EXTENDED_MESSAGE);
    buf.write_var_int(ext_msg::SET_QUEST_HINTS as u32);
    let mark = buf.write_payload_size();
    buf.write_ubyte(hints.len() as u8);
    for hint in hints {
        write_local_msg(&mut buf, hint);
    }
    buf.backpatch_payload_size(mark);
}

#[cfg(test)]
mod tests {
    use super::*;
    use knights_protocol::InputByteBuf;

    #[test]
    fn quest_hints_payload_size_is_backpatched() {
        let mut out = Vec::new();
        set_quest_hints(
            &mut out,
            &[LocalMsg::new("hint_find_gems"), LocalMsg::new("hint_fight")],
        );

        let mut r = InputByteBuf::new(&out);
        assert_eq!(r.read_ubyte().unwrap(), server_msg::EXTENDED_MESSAGE);
        assert_eq!(r.read_var_int().unwrap(), ext_msg::SET_QUEST_HINTS as u32);
        let size = r.read_ushort().unwrap() as usize;
        assert_eq!(size, r.remaining());
    }

    #[test]
    fn potion_magic_packs_immunity_in_bit_7() {
        let mut out = Vec::new();
        set_potion_magic(&mut out, PotionMagic::Poison, true);
        assert_eq!(out[1], 128 + PotionMagic::Poison as u8);
    }
}
