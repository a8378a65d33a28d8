use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 6770;
pub const DEFAULT_SAVE_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_APP_VERSION: u32 = 1;
pub const DEFAULT_MAX_FRAME_BYTES: usize = crate::frame::DEFAULT_MAX_FRAME_BYTES;

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Persistence base path; each store saves to
    /// `<base>.<name>.db`. `None` keeps data in memory only.
    pub base_path: Option<String>,
    /// Version tag written into every store snapshot.
    pub app_version: u32,
    /// How often (in seconds) the saver drains the dirty counter.
    pub save_interval_secs: u64,
    pub metrics_host: String,
    pub metrics_port: u16,
    /// Largest accepted request frame body.
    pub max_frame_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            base_path: None,
            app_version: DEFAULT_APP_VERSION,
            save_interval_secs: DEFAULT_SAVE_INTERVAL_SECS,
            metrics_host: "0.0.0.0".to_string(),
            metrics_port: 9090,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var("TREEKV_HOST").ok().as_deref(),
            std::env::var("TREEKV_PORT").ok().as_deref(),
            std::env::var("TREEKV_BASE_PATH").ok().as_deref(),
            std::env::var("TREEKV_APP_VERSION").ok().as_deref(),
            std::env::var("TREEKV_SAVE_INTERVAL").ok().as_deref(),
            std::env::var("TREEKV_METRICS_HOST").ok().as_deref(),
            std::env::var("TREEKV_METRICS_PORT").ok().as_deref(),
            std::env::var("TREEKV_MAX_FRAME").ok().as_deref(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn from_vars(
        host: Option<&str>,
        port: Option<&str>,
        base_path: Option<&str>,
        app_version: Option<&str>,
        save_interval: Option<&str>,
        metrics_host: Option<&str>,
        metrics_port: Option<&str>,
        max_frame: Option<&str>,
    ) -> Self {
        let defaults = Self::default();
        Self {
            host: host.map(|s| s.to_string()).unwrap_or(defaults.host),
            port: port.and_then(|s| s.parse().ok()).unwrap_or(defaults.port),
            base_path: base_path
                .map(|s| s.to_string())
                .filter(|s| !s.is_empty()),
            app_version: app_version
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.app_version),
            save_interval_secs: save_interval
                .and_then(|s| s.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(defaults.save_interval_secs),
            metrics_host: metrics_host
                .map(|s| s.to_string())
                .unwrap_or(defaults.metrics_host),
            metrics_port: metrics_port
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.metrics_port),
            max_frame_bytes: max_frame
                .and_then(|s| s.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(defaults.max_frame_bytes),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn metrics_listen_addr(&self) -> String {
        format!("{}:{}", self.metrics_host, self.metrics_port)
    }

    pub fn base_path_buf(&self) -> Option<PathBuf> {
        self.base_path.as_ref().map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_correct() {
        let c = Config::default();
        assert_eq!(c.port, 6770);
        assert_eq!(c.host, "0.0.0.0");
        assert!(c.base_path.is_none());
        assert_eq!(c.save_interval_secs, 1);
        assert_eq!(c.app_version, 1);
    }

    #[test]
    fn from_vars_all_none_returns_defaults() {
        let c = Config::from_vars(None, None, None, None, None, None, None, None);
        assert_eq!(c.port, Config::default().port);
        assert_eq!(c.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
    }

    #[test]
    fn from_vars_overrides_apply() {
        let c = Config::from_vars(
            Some("127.0.0.1"),
            Some("7000"),
            Some("/tmp/ts"),
            Some("5"),
            Some("30"),
            Some("127.0.0.1"),
            Some("9999"),
            Some("1024"),
        );
        assert_eq!(c.listen_addr(), "127.0.0.1:7000");
        assert_eq!(c.base_path.as_deref(), Some("/tmp/ts"));
        assert_eq!(c.app_version, 5);
        assert_eq!(c.save_interval_secs, 30);
        assert_eq!(c.metrics_listen_addr(), "127.0.0.1:9999");
        assert_eq!(c.max_frame_bytes, 1024);
    }

    #[test]
    fn bad_values_fall_back_to_defaults() {
        let c = Config::from_vars(
            None,
            Some("not-a-port"),
            Some(""),
            Some("x"),
            Some("0"),
            None,
            None,
            Some("0"),
        );
        assert_eq!(c.port, DEFAULT_PORT);
        assert!(c.base_path.is_none(), "empty base path means memory only");
        assert_eq!(c.app_version, DEFAULT_APP_VERSION);
        assert_eq!(c.save_interval_secs, DEFAULT_SAVE_INTERVAL_SECS);
        assert_eq!(c.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
    }

    #[test]
    fn base_path_buf_converts() {
        let mut c = Config::default();
        c.base_path = Some("/data/ts".to_string());
        assert_eq!(c.base_path_buf(), Some(PathBuf::from("/data/ts")));
    }
}
