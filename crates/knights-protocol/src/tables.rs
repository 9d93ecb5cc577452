//! Asset-table entries sent to clients in `JoinGameAccepted`.
//!
//! Graphics, anims, overlays and sounds are identified by dense ids
//! starting at 1; the tables are serialized in id order and afterwards
//! everything on the wire refers to entries by id only. Id 0 always means
//! "none".

use serde::{Deserialize, Serialize};

use crate::types::ColourChange;
use crate::{InputByteBuf, OutputByteBuf, ProtocolError};

/// Number of facing directions an anim covers.
pub const ANIM_DIRECTIONS: usize = 4;
/// Frames per facing direction.
pub const ANIM_FRAMES: usize = 8;
/// Frames per overlay.
pub const OVERLAY_FRAMES: usize = 4;

/// A single image asset, referenced by file path within the data
/// directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graphic {
    #[serde(default)]
    pub id: u32,
    pub path: String,
    #[serde(default)]
    pub hx: i16,
    #[serde(default)]
    pub hy: i16,
    /// Transparency key; (-1,-1,-1) if transparency is not used.
    #[serde(default = "minus_one")]
    pub r: i16,
    #[serde(default = "minus_one")]
    pub g: i16,
    #[serde(default = "minus_one")]
    pub b: i16,
    #[serde(default = "one")]
    pub size_hint_num: u32,
    #[serde(default = "one")]
    pub size_hint_denom: u32,
    #[serde(default)]
    pub colour_change: Option<ColourChange>,
}

fn minus_one() -> i16 {
    -1
}

fn one() -> u32 {
    1
}

impl Graphic {
    pub fn serialize(&self, buf: &mut OutputByteBuf<'_>) {
        buf.write_string(&self.path);
        buf.write_short(self.hx);
        buf.write_short(self.hy);
        buf.write_short(self.r);
        buf.write_short(self.g);
        buf.write_short(self.b);
        buf.write_var_int(self.size_hint_num);
        buf.write_var_int(self.size_hint_denom);
        match &self.colour_change {
            Some(cc) => {
                buf.write_ubyte(1);
                cc.serialize(buf);
            }
            None => buf.write_ubyte(0),
        }
    }

    pub fn deserialize(id: u32, buf: &mut InputByteBuf<'_>) -> Result<Self, ProtocolError> {
        Ok(Graphic {
            id,
            path: buf.read_string()?,
            hx: buf.read_short()?,
            hy: buf.read_short()?,
            r: buf.read_short()?,
            g: buf.read_short()?,
            b: buf.read_short()?,
            size_hint_num: buf.read_var_int()?,
            size_hint_denom: buf.read_var_int()?,
            colour_change: match buf.read_ubyte()? {
                0 => None,
                _ => Some(ColourChange::deserialize(buf)?),
            },
        })
    }
}

/// An entity animation: one graphic id per (direction, frame), plus the
/// colour changes applied in the normal and invulnerable states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anim {
    #[serde(default)]
    pub id: u32,
    /// `frames[direction][frame]`, graphic id or 0.
    pub frames: Vec<Vec<u32>>,
    #[serde(default)]
    pub cc_normal: ColourChange,
    #[serde(default)]
    pub cc_invulnerable: ColourChange,
    #[serde(default)]
    pub vbat_mode: bool,
}

impl Anim {
    pub fn serialize(&self, buf: &mut OutputByteBuf<'_>) {
        for dir in 0..ANIM_DIRECTIONS {
            for frame in 0..ANIM_FRAMES {
                let gfx = self
                    .frames
                    .get(dir)
                    .and_then(|row| row.get(frame))
                    .copied()
                    .unwrap_or(0);
                buf.write_var_int(gfx);
            }
        }
        self.cc_normal.serialize(buf);
        self.cc_invulnerable.serialize(buf);
        buf.write_ubyte(self.vbat_mode as u8);
    }

    pub fn deserialize(id: u32, buf: &mut InputByteBuf<'_>) -> Result<Self, ProtocolError> {
        let mut frames = Vec::with_capacity(ANIM_DIRECTIONS);
        for _ in 0..ANIM_DIRECTIONS {
            let mut row = Vec::with_capacity(ANIM_FRAMES);
            for _ in 0..ANIM_FRAMES {
                row.push(buf.read_var_int()?);
            }
            frames.push(row);
        }
        Ok(Anim {
            id,
            frames,
            cc_normal: ColourChange::deserialize(buf)?,
            cc_invulnerable: ColourChange::deserialize(buf)?,
            vbat_mode: buf.read_ubyte()? != 0,
        })
    }
}

/// An overlay drawn on top of an entity (e.g. a carried weapon): one
/// graphic id per direction plus per-frame offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overlay {
    #[serde(default)]
    pub id: u32,
    /// Graphic id per facing direction, 0 = not drawn.
    pub graphics: Vec<u32>,
    /// `(ofsx, ofsy, dir)` per (frame, direction).
    #[serde(default)]
    pub offsets: Vec<(i16, i16, u8)>,
}

impl Overlay {
    pub fn serialize(&self, buf: &mut OutputByteBuf<'_>) {
        for dir in 0..ANIM_DIRECTIONS {
            buf.write_var_int(self.graphics.get(dir).copied().unwrap_or(0));
        }
        buf.write_var_int(self.offsets.len() as u32);
        for (x, y, dir) in &self.offsets {
            buf.write_short(*x);
            buf.write_short(*y);
            buf.write_ubyte(*dir);
        }
    }

    pub fn deserialize(id: u32, buf: &mut InputByteBuf<'_>) -> Result<Self, ProtocolError> {
        let mut graphics = Vec::with_capacity(ANIM_DIRECTIONS);
        for _ in 0..ANIM_DIRECTIONS {
            graphics.push(buf.read_var_int()?);
        }
        let n = buf.read_var_int()? as usize;
        let mut offsets = Vec::with_capacity(n);
        for _ in 0..n {
            offsets.push((buf.read_short()?, buf.read_short()?, buf.read_ubyte()?));
        }
        Ok(Overlay {
            id,
            graphics,
            offsets,
        })
    }
}

/// A sound asset, referenced by file path within the data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sound {
    #[serde(default)]
    pub id: u32,
    pub path: String,
}

impl Sound {
    pub fn serialize(&self, buf: &mut OutputByteBuf<'_>) {
        buf.write_string(&self.path);
    }

    pub fn deserialize(id: u32, buf: &mut InputByteBuf<'_>) -> Result<Self, ProtocolError> {
        Ok(Sound {
            id,
            path: buf.read_string()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Colour;

    #[test]
    fn graphic_round_trip() {
        let mut cc = ColourChange::new();
        cc.add(Colour::rgb(255, 0, 0), Colour::rgb(0, 255, 0));
        let gfx = Graphic {
            id: 3,
            path: "knight_idle.png".into(),
            hx: 8,
            hy: 12,
            r: -1,
            g: -1,
            b: -1,
            size_hint_num: 3,
            size_hint_denom: 1,
            colour_change: Some(cc),
        };
        let mut v = Vec::new();
        gfx.serialize(&mut OutputByteBuf::new(&mut v));
        assert_eq!(Graphic::deserialize(3, &mut InputByteBuf::new(&v)).unwrap(), gfx);
    }

    #[test]
    fn anim_pads_missing_frames() {
        let anim = Anim {
            id: 1,
            frames: vec![vec![7]], // only one direction, one frame
            cc_normal: ColourChange::new(),
            cc_invulnerable: ColourChange::new(),
            vbat_mode: false,
        };
        let mut v = Vec::new();
        anim.serialize(&mut OutputByteBuf::new(&mut v));
        let decoded = Anim::deserialize(1, &mut InputByteBuf::new(&v)).unwrap();
        assert_eq!(decoded.frames[0][0], 7);
        assert_eq!(decoded.frames[0][1], 0);
        assert_eq!(decoded.frames[3][7], 0);
    }
}
