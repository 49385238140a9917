/// Subsystem tags; each becomes a `log` target so `RUST_LOG` can filter per subsystem
///
/// `RUST_LOG=geocall::retry=debug` enables debug output for the retry loop only.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogTag {
    Engine,
    Cache,
    RateLimit,
    Retry,
    Coalesce,
    Config,
    Api,
}

impl LogTag {
    pub fn target(&self) -> &'static str {
        match self {
            LogTag::Engine => "geocall::engine",
            LogTag::Cache => "geocall::cache",
            LogTag::RateLimit => "geocall::rate_limiter",
            LogTag::Retry => "geocall::retry",
            LogTag::Coalesce => "geocall::coalesce",
            LogTag::Config => "geocall::config",
            LogTag::Api => "geocall::apis",
        }
    }

    /// Short uppercase label used as message prefix
    pub fn label(&self) -> &'static str {
        match self {
            LogTag::Engine => "ENGINE",
            LogTag::Cache => "CACHE",
            LogTag::RateLimit => "LIMITER",
            LogTag::Retry => "RETRY",
            LogTag::Coalesce => "COALESCE",
            LogTag::Config => "CONFIG",
            LogTag::Api => "API",
        }
    }
}

impl std::fmt::Display for LogTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
