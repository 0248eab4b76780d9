use serde::Serialize;

#[derive(Debug, Serialize, Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 音频设备配置
    pub capture_device: &'static str,
    pub playback_device: &'static str,
    /// 0 means "use the playback device's native rate".
    pub sample_rate: u32,
    pub channels: u16,
    pub audio_source: &'static str,
    pub record_buffer_factor: f64,
    pub playout_buffer_factor: f64,
    pub low_latency: bool,
    pub realtime_priority: i32,

    // 硬件音效
    pub enable_aec: bool,
    pub enable_ns: bool,

    // 诊断
    pub verify_delay_ms: u64,
    pub stats_interval_secs: u64,
    pub join_timeout_ms: u64,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            capture_device: env!("CAPTURE_DEVICE"),
            playback_device: env!("PLAYBACK_DEVICE"),
            sample_rate: env!("SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse SAMPLE_RATE")?,
            channels: env!("CHANNELS").parse()
                .map_err(|_| "Failed to parse CHANNELS")?,
            audio_source: env!("AUDIO_SOURCE"),
            record_buffer_factor: env!("RECORD_BUFFER_FACTOR").parse()
                .map_err(|_| "Failed to parse RECORD_BUFFER_FACTOR")?,
            playout_buffer_factor: env!("PLAYOUT_BUFFER_FACTOR").parse()
                .map_err(|_| "Failed to parse PLAYOUT_BUFFER_FACTOR")?,
            low_latency: env!("LOW_LATENCY").parse()
                .map_err(|_| "Failed to parse LOW_LATENCY")?,
            realtime_priority: env!("REALTIME_PRIORITY").parse()
                .map_err(|_| "Failed to parse REALTIME_PRIORITY")?,

            enable_aec: env!("ENABLE_AEC").parse()
                .map_err(|_| "Failed to parse ENABLE_AEC")?,
            enable_ns: env!("ENABLE_NS").parse()
                .map_err(|_| "Failed to parse ENABLE_NS")?,

            verify_delay_ms: env!("VERIFY_DELAY_MS").parse()
                .map_err(|_| "Failed to parse VERIFY_DELAY_MS")?,
            stats_interval_secs: env!("STATS_INTERVAL_SECS").parse()
                .map_err(|_| "Failed to parse STATS_INTERVAL_SECS")?,
            join_timeout_ms: env!("JOIN_TIMEOUT_MS").parse()
                .map_err(|_| "Failed to parse JOIN_TIMEOUT_MS")?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().expect("Failed to create default Config from build-time environment variables")
    }
}
