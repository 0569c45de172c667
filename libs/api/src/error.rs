/// Что пошло не так: host решает по kind'у, падать ли при старте,
/// переоткрывать ли sink или просто отправить сообщение в drop stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad plugin table; fatal while wiring.
    Config,
    /// Sink or source I/O.
    Io,
    /// A formatter rejected the message.
    Format,
    /// Command does not fit the plugin's lifecycle state.
    State,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Format => "format",
            ErrorKind::State => "state",
        })
    }
}

/// Error crossing the plugin boundary: factories, formatters, control calls.
#[derive(Clone)]
pub struct PluginError {
    kind: ErrorKind,
    message: String,
}

impl PluginError {
    fn with_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Config, message)
    }

    pub fn format_err(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Format, message)
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::State, message)
    }

    /// `"<ctx>: <message>"`, same kind.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        Self::with_kind(self.kind, format!("{ctx}: {}", self.message))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Debug for PluginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

impl std::fmt::Display for PluginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for PluginError {}

impl From<std::io::Error> for PluginError {
    fn from(e: std::io::Error) -> Self {
        Self::with_kind(ErrorKind::Io, e.to_string())
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(e: serde_json::Error) -> Self {
        Self::with_kind(ErrorKind::Format, e.to_string())
    }
}

impl From<std::str::Utf8Error> for PluginError {
    fn from(e: std::str::Utf8Error) -> Self {
        Self::with_kind(ErrorKind::Format, format!("payload is not utf-8: {e}"))
    }
}
