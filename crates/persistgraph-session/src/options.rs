//! Options accepted by `save` and `remove`.

/// How the call relates to a transactional scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionMode {
    /// Open a scope unless one is already active, and finish what was opened.
    #[default]
    Auto,
    /// Run inside the caller's active scope; never commit or roll it back.
    Existing,
    /// Run without any scope (no atomicity).
    None,
}

/// Options for `Session::save()` and `Session::remove()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOptions {
    /// Fire entity listeners.
    pub listeners: bool,
    /// Transactional scope handling.
    pub transaction: TransactionMode,
    /// Split the root entities into sub-calls of at most this many roots,
    /// all sharing one scope.
    pub chunk_size: Option<usize>,
    /// Keep generated values and refreshed snapshots in the graph. When
    /// unset the graph is left as it was before the call, listener edits
    /// included.
    pub reload: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            listeners: true,
            transaction: TransactionMode::Auto,
            chunk_size: None,
            reload: true,
        }
    }
}

impl SaveOptions {
    /// Create new default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `listeners` option (builder pattern).
    #[must_use]
    pub fn with_listeners(mut self, value: bool) -> Self {
        self.listeners = value;
        self
    }

    /// Set the transaction mode (builder pattern).
    #[must_use]
    pub fn with_transaction(mut self, mode: TransactionMode) -> Self {
        self.transaction = mode;
        self
    }

    /// Set the chunk size (builder pattern). Zero disables chunking.
    #[must_use]
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = if size == 0 { None } else { Some(size) };
        self
    }

    /// Set the `reload` option (builder pattern).
    #[must_use]
    pub fn with_reload(mut self, value: bool) -> Self {
        self.reload = value;
        self
    }
}

/// Options for `Session::remove()`.
pub type RemoveOptions = SaveOptions;
