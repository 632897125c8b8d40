//! Convenience macros.

/// Log an event at a runtime [`LogLevel`](crate::utils::LogLevel) with
/// optional `key => value` metadata rendered as `[k=v,k=v]`.
///
/// # Examples
///
/// ```
/// use ferry_core::log_event;
/// use ferry_core::utils::LogLevel;
///
/// log_event!(LogLevel::Info, "Connections closed");
///
/// log_event!(LogLevel::verbosity(true), "Connection obtained",
///     pool => "mongo",
///     slot => 3,
/// );
/// ```
#[macro_export]
macro_rules! log_event {
    ($level:expr, $message:expr) => {{
        let level: $crate::__log::Level = ($level).into();
        $crate::__log::log!(level, "{}", $message);
    }};

    ($level:expr, $message:expr, $($key:ident => $value:expr),+ $(,)?) => {{
        let level: $crate::__log::Level = ($level).into();
        if $crate::__log::log_enabled!(level) {
            let metadata = [$(format!("{}={}", stringify!($key), $value)),+].join(",");
            $crate::__log::log!(level, "{} [{}]", $message, metadata);
        }
    }};
}
