//! One-byte message codes and small wire enums.
//!
//! The comments on each code describe the fields that follow it on the
//! wire; "complex" messages are built and parsed in the layer that owns
//! them.

/// Messages sent by the client.
pub mod client_msg {
    pub const SET_PLAYER_ID: u8 = 1; // string (my player id). should be 1st cmd sent.
    pub const JOIN_GAME: u8 = 3; // string (game name)
    pub const JOIN_GAME_SPLIT_SCREEN: u8 = 4; // string (game name)
    pub const LEAVE_GAME: u8 = 5; // no extra data
    pub const CHAT: u8 = 6; // utf-8 string
    pub const SET_READY: u8 = 7; // ubyte (ready-status)
    pub const SET_HOUSE_COLOUR: u8 = 8; // ubyte (house col)
    pub const SET_MENU_SELECTION: u8 = 9; // 2 varints (item, choice)
    pub const FINISHED_LOADING: u8 = 10; // no extra data
    pub const SEND_CONTROL: u8 = 11; // ubyte (bits 0-6: control num; bit 7: display num)
    pub const READY_TO_END: u8 = 12; // no extra data
    pub const SET_PAUSE_MODE: u8 = 14; // ubyte (paused-flag). split screen only.
    pub const SEND_PASSWORD: u8 = 15; // string (the password)
    pub const SET_OBS_FLAG: u8 = 17; // ubyte (0=player, 1=observer)
    pub const REQUEST_SPEECH_BUBBLE: u8 = 18; // ubyte (0=hide, 1=show)
    pub const SET_APPROACH_BASED_CONTROLS: u8 = 19; // ubyte (1=true 0=false)
    pub const SET_ACTION_BAR_CONTROLS: u8 = 20; // ubyte (1=true 0=false)
    pub const RANDOM_QUEST: u8 = 21; // no extra data
}

/// Messages sent by the server.
pub mod server_msg {
    pub const ERROR: u8 = 1; // localized key + params
    pub const CONNECTION_ACCEPTED: u8 = 2; // varint (server version number)
    pub const JOIN_GAME_ACCEPTED: u8 = 3; // complex
    pub const JOIN_GAME_DENIED: u8 = 4; // string (reason, as loc key)
    pub const PLAYER_CONNECTED: u8 = 6; // string (player id)
    pub const PLAYER_DISCONNECTED: u8 = 7; // string (player id)

    pub const LEAVE_GAME: u8 = 8; // no extra data
    pub const SET_MENU_SELECTION: u8 = 9; // varint (item), varint (choice), varint num allowed + allowed choices
    pub const SET_QUEST_DESCRIPTION: u8 = 10; // varint num paragraphs + LocalMsgs
    pub const START_GAME: u8 = 11; // ubyte num_displays, ubyte deathmatch, ubyte already_started
    pub const GOTO_MENU: u8 = 12; // no extra data
    pub const START_GAME_OBS: u8 = 13; // ubyte num_displays, ubyte deathmatch, NDisp strings, ubyte already_started
    pub const GO_INTO_OBS_MODE: u8 = 14; // ubyte num displays + NDisp strings

    pub const PLAYER_JOINED_THIS_GAME: u8 = 20; // string id, ubyte obs-flag, ubyte house-col
    pub const PLAYER_LEFT_THIS_GAME: u8 = 21; // string id, ubyte obs-flag
    pub const SET_READY: u8 = 22; // string id, ubyte ready
    pub const SET_HOUSE_COLOUR: u8 = 23; // string id, ubyte house col
    pub const SET_AVAILABLE_HOUSE_COLOURS: u8 = 24; // ubyte n + n (r,g,b) triples
    pub const SET_OBS_FLAG: u8 = 25; // string id, ubyte (1=obs 0=player)
    pub const DEACTIVATE_READY_FLAGS: u8 = 26; // no additional data

    pub const CHAT: u8 = 30; // string id, ubyte ChatKind, utf-8 string
    pub const ANNOUNCEMENT_LOC: u8 = 32; // LocalMsg
    pub const POP_UP_WINDOW: u8 = 33; // complex; 1-player games only
    pub const REQUEST_PASSWORD: u8 = 35; // ubyte (first_attempt)

    pub const UPDATE_GAME: u8 = 36; // string name, varint np, varint nobs, ubyte status
    pub const DROP_GAME: u8 = 37; // string name
    pub const UPDATE_PLAYER: u8 = 38; // string id, string game name, ubyte obs-flag
    pub const PLAYER_LIST: u8 = 39; // complex
    pub const TIME_REMAINING: u8 = 40; // varint (ms)
    pub const READY_TO_END: u8 = 41; // string (id of player ready to end)

    // engine callbacks
    pub const PLAY_SOUND: u8 = 50; // varint soundnum, varint frequency
    pub const WIN_GAME: u8 = 51; // no extra data
    pub const LOSE_GAME: u8 = 52; // no extra data
    pub const SET_AVAILABLE_CONTROLS: u8 = 53; // ubyte n + ubytes (bit7=primary, bits0-6=control id)
    pub const SET_MENU_HIGHLIGHT: u8 = 54; // ubyte (control id)
    pub const FLASH_SCREEN: u8 = 55; // varint (delay)

    // dungeon view
    pub const SET_CURRENT_ROOM: u8 = 100; // varint room, nibbles (width, height)
    pub const ADD_ENTITY: u8 = 101; // complex
    pub const RM_ENTITY: u8 = 102; // varint id
    pub const REPOSITION_ENTITY: u8 = 103; // varint id, room coord
    pub const MOVE_ENTITY: u8 = 104; // varint id, nibbles (motion type, missile mode), ushort duration
    pub const FLIP_ENTITY_MOTION: u8 = 105; // varint id, ushort initial_delay, ushort duration
    pub const SET_ANIM_DATA: u8 = 106; // complex
    pub const SET_FACING: u8 = 107; // varint id, ubyte facing
    pub const CLEAR_TILES: u8 = 108; // room coord
    pub const SET_TILE: u8 = 109; // room coord, tile info, varint gfx, cc if flagged
    pub const SET_ITEM: u8 = 110; // room coord, varint gfx
    pub const PLACE_ICON: u8 = 111; // room coord, varint gfx, ushort duration
    pub const FLASH_MESSAGE: u8 = 112; // LocalMsg, ubyte ntimes
    pub const CANCEL_CONTINUOUS_MESSAGES: u8 = 113; // no data
    pub const ADD_CONTINUOUS_MESSAGE: u8 = 114; // LocalMsg
    pub const SET_SPEECH_BUBBLE: u8 = 115; // varint id, ubyte show flag

    // mini-map
    pub const SET_MAP_SIZE: u8 = 150; // 2 ubytes (width, height)
    pub const SET_COLOUR: u8 = 151; // complex (runs)
    pub const WIPE_MAP: u8 = 152; // no data
    pub const MAP_KNIGHT_LOCATION: u8 = 153; // ubyte plyr, EITHER 2 ubytes (x,y) OR 1 ubyte (255)
    pub const MAP_ITEM_LOCATION: u8 = 154; // 3 ubytes (x, y, flag)

    // status display
    pub const SET_BACKPACK: u8 = 200; // ubyte slot, 2 varints (gfx ids), 2 ubytes (carried, max)
    pub const ADD_SKULL: u8 = 201; // no data
    pub const SET_HEALTH: u8 = 202; // varint (health)
    pub const SET_POTION_MAGIC: u8 = 203; // ubyte (bit7 = poison immunity, bits0-6 = potion magic)

    // misc
    pub const SWITCH_PLAYER: u8 = 250; // ubyte (player number)

    // extended messages; ignored by clients that don't know the code
    pub const EXTENDED_MESSAGE: u8 = 255; // varint ext code, ushort payload length, payload
}

/// Extended message codes, carried inside `server_msg::EXTENDED_MESSAGE`.
pub mod ext_msg {
    pub const SET_QUEST_HINTS: u8 = 1; // num hints, hints as LocalMsgs
    pub const NEXT_ANNOUNCEMENT_IS_ERROR: u8 = 2;
    pub const DISABLE_VIEW: u8 = 3;
}

/// Host-migration messages sent by the leader.
pub mod leader_msg {
    // sync phase
    pub const SEND_VM_CONFIG: u8 = 64; // vm config bytes
    pub const SEND_MEMORY_BLOCK: u8 = 65; // compressed block group
    pub const SEND_CATCHUP_TICKS: u8 = 66; // varint length + tick data
    pub const SYNC_DONE: u8 = 67; // no additional data

    // steady state
    pub const SEND_TICK_DATA: u8 = 48; // varint length + tick data
    pub const SEND_CHECKSUM: u8 = 49; // u32 timer_ms + u64 checksum
}

/// Host-migration messages sent by a follower.
pub mod follower_msg {
    // sync phase
    pub const SEND_HASHES: u8 = 32; // memory block hashes
    pub const ACK_MEMORY_BLOCKS: u8 = 33; // varint (number of blocks acked)
    pub const ACK_CATCHUP_TICKS: u8 = 34; // varint (number of tick segments acked)

    // steady state
    pub const SEND_CLIENT_COMMANDS: u8 = 16; // varint length + data
}

/// VM memory is synced in blocks of this size.
pub const HOST_MIGRATION_BLOCK_SHIFT: u32 = 9;
pub const HOST_MIGRATION_BLOCK_SIZE_BYTES: u32 = 1 << HOST_MIGRATION_BLOCK_SHIFT;

/// Second byte of a `server_msg::CHAT` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChatKind {
    Lobby = 0,
    Player = 1,
    Observer = 2,
    Team = 3,
}

/// Status byte in a `server_msg::PLAYER_LIST` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlayerListState {
    Normal = 0,
    Eliminated = 1,
    Disconnected = 2,
    Observer = 3,
}
