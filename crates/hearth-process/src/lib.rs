/// Lifecycle of the single supervised game process.
///
/// NOTE: Transitions only ever move forward along
/// `Down -> Starting -> Up -> Stopping -> Down`. A process that dies while
/// `Starting` or `Up` drops straight back to `Down`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ProcessStatus {
    Down = 0,
    Starting = 1,
    Up = 2,
    Stopping = 3,
}

impl ProcessStatus {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Inverse of [`ProcessStatus::as_u8`]; unknown values read as `Down`.
    pub const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Starting,
            2 => Self::Up,
            3 => Self::Stopping,
            _ => Self::Down,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Down => "down",
            Self::Starting => "starting",
            Self::Up => "up",
            Self::Stopping => "stopping",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: ProcessStatus) -> bool {
        matches!(
            (self, next),
            (Self::Down, Self::Starting)
                | (Self::Starting, Self::Up)
                | (Self::Up, Self::Stopping)
                | (Self::Stopping, Self::Down)
                // crash paths
                | (Self::Starting, Self::Down)
                | (Self::Up, Self::Down)
        )
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessAction {
    Start,
    Stop,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProcessControlRequest {
    pub action: ProcessAction,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProcessStatusResponse {
    pub status: ProcessStatus,
    pub pid: Option<u32>,
}
