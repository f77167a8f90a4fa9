/// Per-invocation settings, handed to every operation.
#[derive(Clone, Copy, Debug, Default)]
pub struct Session {
    /// Verbose tracing, verbose rsync, and unwrapped error reports.
    pub debug: bool,
}

impl Session {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }

    pub fn rsync_flags(&self) -> &'static str {
        if self.debug { "-av" } else { "-a" }
    }
}
