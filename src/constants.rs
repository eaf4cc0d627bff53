pub const DEFAULT_CONFIG_PATH: &str = "/etc/cutover/config.json";
pub const CONFIG_PATH_ENV: &str = "CUTOVER_CONFIG";
pub const STRICT_VERIFY_ENV: &str = "CUTOVER_STRICT_VERIFY";

pub const DEFAULT_STATE_ROOT: &str = "/var/lib/cutover";
pub const DEFAULT_BACKUP_ROOT: &str = "/var/backups/cutover";
pub const DEFAULT_REMOTE_WORK_DIR: &str = "/tmp/cutover";
pub const DEFAULT_REMOTE_BACKUP_ROOT: &str = "/var/backups/cutover";

pub const STATE_FILE: &str = "release-state.json";
pub const MANIFEST_NAME: &str = "manifest.json";
pub const BACKUP_EXT: &str = "tar.gz";
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%3f";

pub const DEFAULT_RETENTION_COUNT: usize = 5;
pub const DEFAULT_COMMAND_TIMEOUT_SECONDS: u64 = 600;
pub const DEFAULT_CONNECT_TIMEOUT_SECONDS: u64 = 15;
pub const DEFAULT_LOCK_STALE_SECONDS: u64 = 6 * 3600;

pub const DEFAULT_HEALTH_URL: &str = "http://127.0.0.1:3000/health";
pub const DEFAULT_HEALTH_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_HEALTH_INITIAL_DELAY_MS: u64 = 1_000;
pub const DEFAULT_HEALTH_MAX_DELAY_MS: u64 = 15_000;
pub const DEFAULT_HEALTH_ATTEMPT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

pub const LOCAL_HOST_NAMES: [&str; 3] = ["local", "localhost", "127.0.0.1"];
pub const MAX_STATE_HISTORY: usize = 50;
