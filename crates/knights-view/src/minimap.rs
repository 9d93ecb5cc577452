//! Mini-map encoder with run coalescing and location memoisation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use knights_engine::MiniMapColour;
use knights_protocol::{server_msg, OutputByteBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Run {
    start_x: u8,
    y: u8,
    cols: Vec<u8>,
}

/// Encoder state for one player's mini-map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MiniMapState {
    runs: Vec<Run>,
    /// Last transmitted location per knight; `None` = transmitted as
    /// unknown.
    prev_locations: BTreeMap<u8, Option<(u8, u8)>>,
}

impl MiniMapState {
    pub fn set_size(&mut self, out: &mut Vec<u8>, width: u8, height: u8) {
        let mut buf = OutputByteBuf::new(out);
        buf.write_ubyte(server_msg::SET_MAP_SIZE);
        buf.write_ubyte(width);
        buf.write_ubyte(height);
    }

    /// Buffers one square colour. Consecutive squares on the same row
    /// extend the current run instead of opening a new command; the
    /// engine maps whole rooms in horizontal sweeps, so this collapses
    /// most of the traffic.
    pub fn set_colour(&mut self, x: u8, y: u8, col: MiniMapColour) {
        if let Some(run) = self.runs.last_mut() {
            if run.y == y && run.start_x as usize + run.cols.len() == x as usize {
                run.cols.push(col as u8);
                return;
            }
        }
        self.runs.push(Run {
            start_x: x,
            y,
            cols: vec![col as u8],
        });
    }

    pub fn wipe_map(&mut self, out: &mut Vec<u8>) {
        out.push(server_msg::WIPE_MAP);
    }

    /// Sends a knight's map location, if it changed since last time.
    pub fn map_knight_location(&mut self, out: &mut Vec<u8>, n: u8, pos: Option<(u8, u8)>) {
        match self.prev_locations.get(&n) {
            Some(prev) if *prev == pos => return,
            _ => {}
        }
        self.prev_locations.insert(n, pos);

        let mut buf = OutputByteBuf::new(out);
        buf.write_ubyte(server_msg::MAP_KNIGHT_LOCATION);
        buf.write_ubyte(n);
        match pos {
            Some((x, y)) => {
                buf.write_ubyte(x);
                buf.write_ubyte(y);
            }
            None => buf.write_ubyte(255),
        }
    }

    pub fn map_item_location(&mut self, out: &mut Vec<u8>, x: u8, y: u8, on: bool) {
        let mut buf = OutputByteBuf::new(out);
        buf.write_ubyte(server_msg::MAP_ITEM_LOCATION);
        buf.write_ubyte(x);
        buf.write_ubyte(y);
        buf.write_ubyte(on as u8);
    }

    /// Appends the buffered colour runs as one `SetColour` command.
    pub fn append_cmds(&self, out: &mut Vec<u8>) {
        if self.runs.is_empty() {
            return;
        }
        let mut buf = OutputByteBuf::new(out);
        buf.write_ubyte(server_msg::SET_COLOUR);
        buf.write_var_int(self.runs.len() as u32);
        for run in &self.runs {
            buf.write_ubyte(run.start_x);
            buf.write_ubyte(run.y);
            buf.write_ubyte(run.cols.len() as u8);
            for &col in &run.cols {
                buf.write_ubyte(col);
            }
        }
    }

    pub fn clear_cmds(&mut self) {
        self.runs.clear();
    }

    /// Forget memoised locations so a catch-up re-sends everything.
    pub fn prepare_for_catch_up(&mut self) {
        self.prev_locations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knights_protocol::InputByteBuf;

    /// Applies the encoded SetColour command(s) to a blank map and
    /// returns the resulting (x, y) -> colour assignments.
    fn decode_colours(bytes: &[u8]) -> Vec<((u8, u8), u8)> {
        let mut result = Vec::new();
        let mut r = InputByteBuf::new(bytes);
        while !r.eof() {
            assert_eq!(r.read_ubyte().unwrap(), server_msg::SET_COLOUR);
            let nruns = r.read_var_int().unwrap();
            for _ in 0..nruns {
                let start_x = r.read_ubyte().unwrap();
                let y = r.read_ubyte().unwrap();
                let len = r.read_ubyte().unwrap();
                for i in 0..len {
                    let col = r.read_ubyte().unwrap();
                    result.push(((start_x + i, y), col));
                }
            }
        }
        result
    }

    #[test]
    fn horizontal_runs_are_coalesced() {
        let mut map = MiniMapState::default();
        for x in 0..5 {
            map.set_colour(x, 2, MiniMapColour::Floor);
        }
        map.set_colour(0, 3, MiniMapColour::Wall);

        let mut out = Vec::new();
        map.append_cmds(&mut out);

        let decoded = decode_colours(&out);
        assert_eq!(decoded.len(), 6);
        // and the wire form used exactly two runs
        let mut r = InputByteBuf::new(&out);
        r.read_ubyte().unwrap();
        assert_eq!(r.read_var_int().unwrap(), 2);
    }

    #[test]
    fn replaying_runs_reproduces_the_set_colour_calls() {
        let calls = [
            (3u8, 1u8, MiniMapColour::Floor),
            (4, 1, MiniMapColour::Floor),
            (9, 1, MiniMapColour::Wall),
            (2, 2, MiniMapColour::Wall),
            (3, 2, MiniMapColour::Unmapped),
        ];
        let mut map = MiniMapState::default();
        for &(x, y, c) in &calls {
            map.set_colour(x, y, c);
        }
        let mut out = Vec::new();
        map.append_cmds(&mut out);

        let decoded = decode_colours(&out);
        let expected: Vec<((u8, u8), u8)> =
            calls.iter().map(|&(x, y, c)| ((x, y), c as u8)).collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn knight_location_is_memoised() {
        let mut map = MiniMapState::default();
        let mut out = Vec::new();

        map.map_knight_location(&mut out, 0, Some((4, 4)));
        let after_first = out.len();
        assert!(after_first > 0);

        map.map_knight_location(&mut out, 0, Some((4, 4)));
        assert_eq!(out.len(), after_first, "unchanged position re-sent");

        map.map_knight_location(&mut out, 0, None);
        assert!(out.len() > after_first);

        map.prepare_for_catch_up();
        let before = out.len();
        map.map_knight_location(&mut out, 0, None);
        assert!(out.len() > before, "catch-up must re-send");
    }
}
