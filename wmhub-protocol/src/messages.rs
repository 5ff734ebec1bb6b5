//! Message classes for the control connection
//!
//! The wire assigns a numeric type tag to every frame. Outbound frames are
//! commands; inbound frames are either command replies (tag echoes the
//! command code) or events (high bit set, low bits index the event table).

use serde_json::Value;

/// Magic prefix of every control connection frame
pub const MAGIC: &[u8; 6] = b"i3-ipc";

/// High bit of the type tag marks an inbound frame as an event
pub const EVENT_FLAG: u32 = 0x8000_0000;

/// Command classes understood by the window manager, with wire codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandKind {
    RunCommand = 0,
    GetWorkspaces = 1,
    Subscribe = 2,
    GetOutputs = 3,
    GetTree = 4,
    GetMarks = 5,
    GetBarConfig = 6,
    GetVersion = 7,
    GetBindingModes = 8,
    GetConfig = 9,
    SendTick = 10,
}

impl CommandKind {
    /// Wire code for this command class
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            CommandKind::RunCommand => "run_command",
            CommandKind::GetWorkspaces => "get_workspaces",
            CommandKind::Subscribe => "subscribe",
            CommandKind::GetOutputs => "get_outputs",
            CommandKind::GetTree => "get_tree",
            CommandKind::GetMarks => "get_marks",
            CommandKind::GetBarConfig => "get_bar_config",
            CommandKind::GetVersion => "get_version",
            CommandKind::GetBindingModes => "get_binding_modes",
            CommandKind::GetConfig => "get_config",
            CommandKind::SendTick => "send_tick",
        }
    }
}

/// Protocol events pushed by the window manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventKind {
    Workspace = 0,
    Output = 1,
    Mode = 2,
    Window = 3,
    BarconfigUpdate = 4,
    Binding = 5,
    Shutdown = 6,
    Tick = 7,
}

impl EventKind {
    /// All protocol events, in wire-code order
    pub const ALL: [EventKind; 8] = [
        EventKind::Workspace,
        EventKind::Output,
        EventKind::Mode,
        EventKind::Window,
        EventKind::BarconfigUpdate,
        EventKind::Binding,
        EventKind::Shutdown,
        EventKind::Tick,
    ];

    /// Map an inbound event code (type tag with the event flag cleared)
    pub fn from_code(code: u32) -> Option<EventKind> {
        Self::ALL.get(code as usize).copied()
    }

    /// Map an event name as used in subscriptions
    pub fn from_name(name: &str) -> Option<EventKind> {
        Self::ALL.iter().copied().find(|e| e.name() == name)
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            EventKind::Workspace => "workspace",
            EventKind::Output => "output",
            EventKind::Mode => "mode",
            EventKind::Window => "window",
            EventKind::BarconfigUpdate => "barconfig_update",
            EventKind::Binding => "binding",
            EventKind::Shutdown => "shutdown",
            EventKind::Tick => "tick",
        }
    }
}

/// A decoded inbound frame: either a pushed event or a command reply
#[derive(Debug, Clone, PartialEq)]
pub enum RawMessage {
    /// Event frame; `code` indexes the event table
    Event { code: u32, body: Value },
    /// Command reply; `code` echoes the command class
    Reply { code: u32, body: Value },
}
