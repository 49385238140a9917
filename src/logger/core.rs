/// Core logging implementation
///
/// Checks whether the `log` facade would accept the record for the tag's
/// target, then forwards it with the tag label as prefix.
use super::levels::LogLevel;
use super::tags::LogTag;

pub fn should_log(tag: &LogTag, level: LogLevel) -> bool {
    log::log_enabled!(target: tag.target(), level.to_log_level())
}

pub fn log_internal(tag: LogTag, level: LogLevel, message: &str) {
    if !should_log(&tag, level) {
        return;
    }
    log::log!(target: tag.target(), level.to_log_level(), "[{}] {}", tag.label(), message);
}
