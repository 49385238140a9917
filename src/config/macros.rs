/// Configuration macros for zero-repetition config definitions
///
/// `config_struct!` defines a configuration struct together with its
/// defaults in one declaration, and generates:
/// - The struct with public fields
/// - The `Default` implementation with the given values
/// - Serde support with `#[serde(default)]`, so partial TOML files load
///
/// # Example
/// ```
/// geocall::config_struct! {
///     pub struct ProbeConfig {
///         callers: usize = 8,
///         enabled: bool = true,
///     }
/// }
///
/// let probe = ProbeConfig::default();
/// assert_eq!(probe.callers, 8);
/// ```
#[macro_export]
macro_rules! config_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field_name:ident: $field_type:ty = $default_value:expr
            ),*
            $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
        #[serde(default)]
        $vis struct $name {
            $(
                $(#[$field_meta])*
                pub $field_name: $field_type,
            )*
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    $(
                        $field_name: $default_value,
                    )*
                }
            }
        }
    };
}
