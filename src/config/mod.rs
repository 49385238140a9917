/// Engine configuration
///
/// - `macros`: `config_struct!` for structs with embedded defaults
/// - `schemas`: `EngineConfig` and its sections
/// - `utils`: TOML loading and parsing
pub mod macros;
pub mod schemas;
pub mod utils;

pub use schemas::{CacheSettings, EngineConfig, RetrySettings, ServiceSettings};
pub use utils::{load_config, load_config_from_path, parse_config, CONFIG_FILE_PATH};
