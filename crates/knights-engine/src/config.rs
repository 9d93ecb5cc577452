//! Per-game configuration: asset tables, quest menu and constraints.
//!
//! A `GameConfig` plays the role the script-driven configuration played in
//! the original game, minus the script interpreter (out of scope): the
//! asset tables and menu structure are loaded from a JSON manifest in the
//! data directory, and the quest rules come from an [`EngineFactory`].
//!
//! Each game owns its own `GameConfig` (menu selections are per-game
//! state); the underlying [`Manifest`] is shared.

use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use knights_protocol::{
    Anim, Colour, Graphic, LocalMsg, Overlay, Sound, UserControl, NUM_STANDARD_CONTROLS,
};

use crate::engine::{EngineError, EngineFactory, EngineParams, EngineStart};

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// The static part of a game configuration, loaded once per server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub graphics: Vec<Graphic>,
    #[serde(default)]
    pub anims: Vec<Anim>,
    #[serde(default)]
    pub overlays: Vec<Overlay>,
    #[serde(default)]
    pub sounds: Vec<Sound>,
    #[serde(default)]
    pub standard_controls: Vec<UserControl>,
    #[serde(default)]
    pub other_controls: Vec<UserControl>,
    #[serde(default)]
    pub approach_offset: u32,
    #[serde(default)]
    pub house_colours: Vec<Colour>,
    #[serde(default)]
    pub menu: Vec<MenuItem>,
}

impl Manifest {
    /// Parses a manifest from JSON bytes and assigns the dense ids
    /// (graphics, anims, overlays and sounds are numbered from 1 in table
    /// order; controls continue from the standard-control block).
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let mut m: Manifest = serde_json::from_slice(bytes)?;
        m.assign_ids();
        Ok(m)
    }

    fn assign_ids(&mut self) {
        for (i, g) in self.graphics.iter_mut().enumerate() {
            g.id = i as u32 + 1;
        }
        for (i, a) in self.anims.iter_mut().enumerate() {
            a.id = i as u32 + 1;
        }
        for (i, o) in self.overlays.iter_mut().enumerate() {
            o.id = i as u32 + 1;
        }
        for (i, s) in self.sounds.iter_mut().enumerate() {
            s.id = i as u32 + 1;
        }
        for (i, c) in self.standard_controls.iter_mut().enumerate() {
            c.id = i as u32 + 1;
        }
        let base = self.standard_controls.len() as u32;
        for (i, c) in self.other_controls.iter_mut().enumerate() {
            c.id = base + i as u32 + 1;
        }
    }

    /// A built-in manifest with the standard controls, six house colours
    /// and a minimal quest menu. Used when the data directory has no
    /// manifest, and by the test suites.
    pub fn builtin() -> Self {
        let dir_control = |name: &str, dir: u8, continuous: bool| UserControl {
            id: 0,
            menu_graphic: 0,
            menu_direction: dir,
            tap_priority: 0,
            action_bar_slot: 0,
            action_bar_priority: 0,
            suicide_key: false,
            menu_special: 0,
            continuous,
            name: name.into(),
        };

        let mut standard_controls = Vec::new();
        for (i, dir) in ["north", "east", "south", "west"].iter().enumerate() {
            standard_controls.push(dir_control(&format!("attack_{dir}"), i as u8, false));
        }
        for (i, dir) in ["north", "east", "south", "west"].iter().enumerate() {
            standard_controls.push(dir_control(&format!("move_{dir}"), i as u8, true));
        }
        standard_controls.push(dir_control("withdraw", 0, false));
        standard_controls.push(dir_control("attack_no_dir", 0, false));
        debug_assert_eq!(standard_controls.len() as u32, NUM_STANDARD_CONTROLS);

        let mut m = Manifest {
            graphics: vec![
                Graphic {
                    id: 0,
                    path: "floor.png".into(),
                    hx: 0,
                    hy: 0,
                    r: -1,
                    g: -1,
                    b: -1,
                    size_hint_num: 1,
                    size_hint_denom: 1,
                    colour_change: None,
                },
                Graphic {
                    id: 0,
                    path: "wall.png".into(),
                    hx: 0,
                    hy: 0,
                    r: -1,
                    g: -1,
                    b: -1,
                    size_hint_num: 1,
                    size_hint_denom: 1,
                    colour_change: None,
                },
                Graphic {
                    id: 0,
                    path: "knight.png".into(),
                    hx: 8,
                    hy: 8,
                    r: -1,
                    g: -1,
                    b: -1,
                    size_hint_num: 1,
                    size_hint_denom: 1,
                    colour_change: None,
                },
                Graphic {
                    id: 0,
                    path: "gem.png".into(),
                    hx: 0,
                    hy: 0,
                    r: -1,
                    g: -1,
                    b: -1,
                    size_hint_num: 1,
                    size_hint_denom: 1,
                    colour_change: None,
                },
            ],
            anims: vec![Anim {
                id: 0,
                frames: vec![vec![3; 8]; 4],
                cc_normal: Default::default(),
                cc_invulnerable: Default::default(),
                vbat_mode: false,
            }],
            overlays: Vec::new(),
            sounds: vec![
                Sound {
                    id: 0,
                    path: "clank.wav".into(),
                },
                Sound {
                    id: 0,
                    path: "scream.wav".into(),
                },
            ],
            standard_controls,
            other_controls: Vec::new(),
            approach_offset: 4,
            house_colours: vec![
                Colour::rgb(255, 0, 0),
                Colour::rgb(0, 255, 0),
                Colour::rgb(0, 0, 255),
                Colour::rgb(255, 255, 0),
                Colour::rgb(0, 255, 255),
                Colour::rgb(255, 0, 255),
            ],
            menu: vec![
                MenuItem {
                    key: "quest".into(),
                    title_key: "quest_title".into(),
                    randomize: true,
                    choices: vec![
                        MenuChoice {
                            value: MenuChoiceValue::Key("quest_duel".into()),
                            min_players: 2,
                            max_players: 0,
                            min_teams: 2,
                            description: Some("quest_duel_desc".into()),
                        },
                        MenuChoice {
                            value: MenuChoiceValue::Key("quest_gem_hunt".into()),
                            min_players: 2,
                            max_players: 0,
                            min_teams: 0,
                            description: Some("quest_gem_hunt_desc".into()),
                        },
                        MenuChoice {
                            value: MenuChoiceValue::Key("quest_tutorial".into()),
                            min_players: 1,
                            max_players: 1,
                            min_teams: 0,
                            description: Some("quest_tutorial_desc".into()),
                        },
                    ],
                },
                MenuItem {
                    key: "time_limit".into(),
                    title_key: "time_limit_title".into(),
                    randomize: false,
                    choices: vec![
                        MenuChoice::int(0),
                        MenuChoice::int(5),
                        MenuChoice::int(10),
                    ],
                },
            ],
        };
        m.assign_ids();
        m
    }
}

// ---------------------------------------------------------------------------
// Menu model
// ---------------------------------------------------------------------------

/// One selectable value of a menu item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MenuChoiceValue {
    Int(i32),
    Key(String),
}

/// One choice of a menu item, with its player/team constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuChoice {
    pub value: MenuChoiceValue,
    /// 0 = unconstrained.
    #[serde(default)]
    pub min_players: u32,
    #[serde(default)]
    pub max_players: u32,
    #[serde(default)]
    pub min_teams: u32,
    /// Localization key contributing a paragraph to the quest description.
    #[serde(default)]
    pub description: Option<String>,
}

impl MenuChoice {
    pub fn int(value: i32) -> Self {
        MenuChoice {
            value: MenuChoiceValue::Int(value),
            min_players: 0,
            max_players: 0,
            min_teams: 0,
            description: None,
        }
    }

    fn allowed(&self, nplayers: u32, nteams: u32) -> bool {
        // With nobody in the lobby yet, everything stays selectable.
        if nplayers == 0 {
            return true;
        }
        if nplayers < self.min_players {
            return false;
        }
        if self.max_players != 0 && nplayers > self.max_players {
            return false;
        }
        nteams >= self.min_teams || self.min_teams == 0
    }
}

/// One row of the quest-selection menu.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItem {
    pub key: String,
    pub title_key: String,
    /// Whether "random quest" may reshuffle this item.
    #[serde(default)]
    pub randomize: bool,
    pub choices: Vec<MenuChoice>,
}

/// Current selections, one choice index per menu item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuState {
    pub selections: Vec<u32>,
}

/// Receives menu-change reports. One implementation writes
/// `SetMenuSelection` wire messages into every connection's buffer,
/// another writes the game log line.
pub trait MenuListener {
    fn setting_changed(
        &mut self,
        item_num: u32,
        item_key: &str,
        choice_num: u32,
        choice: &MenuChoiceValue,
        allowed_choices: &[u32],
    );

    fn quest_description_changed(&mut self, _paragraphs: &[LocalMsg]) {}
}

// ---------------------------------------------------------------------------
// GameConfig
// ---------------------------------------------------------------------------

/// Everything one game needs from its configuration: the shared manifest,
/// this game's menu selections, and the engine factory.
#[derive(Clone)]
pub struct GameConfig {
    manifest: Arc<Manifest>,
    factory: Arc<dyn EngineFactory>,
    menu: MenuState,
    nplayers: u32,
    nteams: u32,
}

impl GameConfig {
    pub fn new(manifest: Arc<Manifest>, factory: Arc<dyn EngineFactory>) -> Self {
        let menu = MenuState {
            selections: vec![0; manifest.menu.len()],
        };
        GameConfig {
            manifest,
            factory,
            menu,
            nplayers: 0,
            nteams: 0,
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn house_colours(&self) -> &[Colour] {
        &self.manifest.house_colours
    }

    pub fn approach_offset(&self) -> u32 {
        self.manifest.approach_offset
    }

    pub fn num_menu_items(&self) -> u32 {
        self.manifest.menu.len() as u32
    }

    pub fn num_choices(&self, item_num: u32) -> u32 {
        self.manifest
            .menu
            .get(item_num as usize)
            .map_or(0, |item| item.choices.len() as u32)
    }

    /// All controls in id order (standard block first).
    pub fn all_controls(&self) -> impl Iterator<Item = &UserControl> {
        self.manifest
            .standard_controls
            .iter()
            .chain(self.manifest.other_controls.iter())
    }

    pub fn control_by_num(&self, control_num: u8) -> Option<&UserControl> {
        if control_num == 0 {
            return None;
        }
        let idx = control_num as usize - 1;
        let std = &self.manifest.standard_controls;
        std.get(idx)
            .or_else(|| self.manifest.other_controls.get(idx - std.len()))
    }

    /// The current menu settings as (item key, value) pairs, for engine
    /// creation and VM snapshots.
    pub fn menu_settings(&self) -> Vec<(String, i32)> {
        self.manifest
            .menu
            .iter()
            .zip(&self.menu.selections)
            .map(|(item, &sel)| {
                let value = match item.choices.get(sel as usize).map(|c| &c.value) {
                    Some(MenuChoiceValue::Int(x)) => *x,
                    _ => sel as i32,
                };
                (item.key.clone(), value)
            })
            .collect()
    }

    pub fn menu_state(&self) -> &MenuState {
        &self.menu
    }

    /// Restores menu selections saved in a VM snapshot.
    pub fn set_menu_state(&mut self, state: MenuState) {
        if state.selections.len() == self.manifest.menu.len() {
            self.menu = state;
        }
    }

    fn allowed_choices(&self, item: &MenuItem) -> Vec<u32> {
        item.choices
            .iter()
            .enumerate()
            .filter(|(_, c)| c.allowed(self.nplayers, self.nteams))
            .map(|(i, _)| i as u32)
            .collect()
    }

    fn report_item(&self, item_num: usize, listener: &mut dyn MenuListener) {
        let item = &self.manifest.menu[item_num];
        let sel = self.menu.selections[item_num];
        listener.setting_changed(
            item_num as u32,
            &item.key,
            sel,
            &item.choices[sel as usize].value,
            &self.allowed_choices(item),
        );
    }

    /// Reports every current setting (used when building
    /// `JoinGameAccepted`).
    pub fn current_menu_settings(&self, listener: &mut dyn MenuListener) {
        for item_num in 0..self.manifest.menu.len() {
            self.report_item(item_num, listener);
        }
        listener.quest_description_changed(&self.quest_description());
    }

    /// Applies a player's menu change. Returns true if anything changed.
    pub fn change_menu_setting(
        &mut self,
        item_num: u32,
        choice_num: u32,
        listener: &mut dyn MenuListener,
    ) -> bool {
        let Some(item) = self.manifest.menu.get(item_num as usize) else {
            return false;
        };
        if choice_num >= item.choices.len() as u32 {
            return false;
        }
        if !self.allowed_choices(item).contains(&choice_num) {
            return false;
        }
        if self.menu.selections[item_num as usize] == choice_num {
            return false;
        }
        self.menu.selections[item_num as usize] = choice_num;
        self.report_item(item_num as usize, listener);
        listener.quest_description_changed(&self.quest_description());
        true
    }

    /// Re-applies constraints after the player or team count changed,
    /// moving any now-disallowed selection to the first allowed choice.
    pub fn change_number_of_players(
        &mut self,
        nplayers: u32,
        nteams: u32,
        listener: &mut dyn MenuListener,
    ) {
        self.nplayers = nplayers;
        self.nteams = nteams;
        let mut description_dirty = false;
        for item_num in 0..self.manifest.menu.len() {
            let allowed = self.allowed_choices(&self.manifest.menu[item_num]);
            let sel = self.menu.selections[item_num];
            if !allowed.contains(&sel) {
                if let Some(&first) = allowed.first() {
                    self.menu.selections[item_num] = first;
                    description_dirty = true;
                }
            }
            // Re-report regardless: the allowed set itself is part of what
            // clients display.
            self.report_item(item_num, listener);
        }
        if description_dirty {
            listener.quest_description_changed(&self.quest_description());
        }
    }

    /// Strict player-count check run immediately before game start.
    pub fn check_num_players_strict(&self, nplayers: u32, nteams: u32) -> Result<(), LocalMsg> {
        for (item, &sel) in self.manifest.menu.iter().zip(&self.menu.selections) {
            let Some(choice) = item.choices.get(sel as usize) else {
                continue;
            };
            if nplayers < choice.min_players {
                return Err(LocalMsg::with_params(
                    "not_enough_players",
                    vec![knights_protocol::LocalParam::Int(choice.min_players as i32)],
                ));
            }
            if choice.max_players != 0 && nplayers > choice.max_players {
                return Err(LocalMsg::with_params(
                    "too_many_players",
                    vec![knights_protocol::LocalParam::Int(choice.max_players as i32)],
                ));
            }
            if choice.min_teams != 0 && nteams < choice.min_teams {
                return Err(LocalMsg::with_params(
                    "not_enough_teams",
                    vec![knights_protocol::LocalParam::Int(choice.min_teams as i32)],
                ));
            }
        }
        Ok(())
    }

    /// Resets all selections to defaults (all players left the game).
    pub fn reset_menu(&mut self) {
        for sel in &mut self.menu.selections {
            *sel = 0;
        }
    }

    /// Picks a random allowed choice for every randomizable item.
    pub fn random_quest(&mut self, rng: &mut impl Rng, listener: &mut dyn MenuListener) {
        for item_num in 0..self.manifest.menu.len() {
            let item = &self.manifest.menu[item_num];
            if !item.randomize {
                continue;
            }
            let allowed = self.allowed_choices(item);
            if allowed.is_empty() {
                continue;
            }
            self.menu.selections[item_num] = allowed[rng.random_range(0..allowed.len())];
            self.report_item(item_num, listener);
        }
        listener.quest_description_changed(&self.quest_description());
    }

    /// Paragraphs describing the currently selected quest.
    pub fn quest_description(&self) -> Vec<LocalMsg> {
        self.manifest
            .menu
            .iter()
            .zip(&self.menu.selections)
            .filter_map(|(item, &sel)| {
                item.choices
                    .get(sel as usize)
                    .and_then(|c| c.description.as_deref())
                    .map(LocalMsg::new)
            })
            .collect()
    }

    /// Starts an engine for the current quest.
    pub fn new_engine(
        &self,
        house_colours: Vec<u8>,
        player_ids: Vec<knights_protocol::PlayerId>,
        rng_seed: u64,
    ) -> Result<EngineStart, EngineError> {
        self.factory.create(EngineParams {
            house_colours,
            player_ids,
            menu_settings: self.menu_settings(),
            rng_seed,
        })
    }

    pub fn restore_engine(
        &self,
        state: &[u8],
    ) -> Result<Box<dyn crate::engine::GameEngine>, EngineError> {
        self.factory.restore(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ArenaFactory;

    struct Recorder {
        changes: Vec<(u32, u32)>,
        descriptions: usize,
    }

    impl MenuListener for Recorder {
        fn setting_changed(
            &mut self,
            item_num: u32,
            _item_key: &str,
            choice_num: u32,
            _choice: &MenuChoiceValue,
            _allowed: &[u32],
        ) {
            self.changes.push((item_num, choice_num));
        }

        fn quest_description_changed(&mut self, _paragraphs: &[LocalMsg]) {
            self.descriptions += 1;
        }
    }

    fn config() -> GameConfig {
        GameConfig::new(Arc::new(Manifest::builtin()), Arc::new(ArenaFactory))
    }

    #[test]
    fn change_menu_setting_reports_change() {
        let mut cfg = config();
        let mut rec = Recorder {
            changes: vec![],
            descriptions: 0,
        };
        assert!(cfg.change_menu_setting(0, 1, &mut rec));
        assert_eq!(rec.changes, vec![(0, 1)]);
        assert!(rec.descriptions > 0);
        // setting the same choice again is not a change
        assert!(!cfg.change_menu_setting(0, 1, &mut rec));
    }

    #[test]
    fn invalid_selection_is_rejected() {
        let mut cfg = config();
        let mut rec = Recorder {
            changes: vec![],
            descriptions: 0,
        };
        assert!(!cfg.change_menu_setting(99, 0, &mut rec));
        assert!(!cfg.change_menu_setting(0, 99, &mut rec));
        assert!(rec.changes.is_empty());
    }

    #[test]
    fn tutorial_quest_needs_exactly_one_player() {
        let mut cfg = config();
        let mut rec = Recorder {
            changes: vec![],
            descriptions: 0,
        };
        // nplayers == 0 keeps everything selectable
        assert!(cfg.change_menu_setting(0, 2, &mut rec));
        assert!(cfg.check_num_players_strict(1, 1).is_ok());
        assert!(cfg.check_num_players_strict(2, 2).is_err());
    }

    #[test]
    fn constraint_moves_selection_when_players_change() {
        let mut cfg = config();
        let mut rec = Recorder {
            changes: vec![],
            descriptions: 0,
        };
        cfg.change_menu_setting(0, 2, &mut rec); // tutorial (max 1 player)
        rec.changes.clear();
        cfg.change_number_of_players(3, 3, &mut rec);
        // selection snapped back to an allowed quest
        assert_ne!(cfg.menu_state().selections[0], 2);
    }
}
