use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    audio: Audio,
    effects: Effects,
    diagnostics: Diagnostics,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    sample_rate: u32,
    channels: u16,
    audio_source: String,
    record_buffer_factor: f64,
    playout_buffer_factor: f64,
    low_latency: bool,
    realtime_priority: i32,
}

#[derive(Deserialize)]
struct Effects {
    enable_aec: bool,
    enable_ns: bool,
}

#[derive(Deserialize)]
struct Diagnostics {
    verify_delay_ms: u64,
    stats_interval_secs: u64,
    join_timeout_ms: u64,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 音频配置
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=SAMPLE_RATE={}", config.audio.sample_rate);
    println!("cargo:rustc-env=CHANNELS={}", config.audio.channels);
    println!("cargo:rustc-env=AUDIO_SOURCE={}", config.audio.audio_source);
    println!("cargo:rustc-env=RECORD_BUFFER_FACTOR={}", config.audio.record_buffer_factor);
    println!("cargo:rustc-env=PLAYOUT_BUFFER_FACTOR={}", config.audio.playout_buffer_factor);
    println!("cargo:rustc-env=LOW_LATENCY={}", config.audio.low_latency);
    println!("cargo:rustc-env=REALTIME_PRIORITY={}", config.audio.realtime_priority);

    // 音效配置
    println!("cargo:rustc-env=ENABLE_AEC={}", config.effects.enable_aec);
    println!("cargo:rustc-env=ENABLE_NS={}", config.effects.enable_ns);

    // 诊断配置
    println!("cargo:rustc-env=VERIFY_DELAY_MS={}", config.diagnostics.verify_delay_ms);
    println!("cargo:rustc-env=STATS_INTERVAL_SECS={}", config.diagnostics.stats_interval_secs);
    println!("cargo:rustc-env=JOIN_TIMEOUT_MS={}", config.diagnostics.join_timeout_ms);

    link_speexdsp();
}

fn link_speexdsp() {
    let target = std::env::var("TARGET").unwrap_or_default();

    if target.contains("musl") {
        // musl 目标：使用手动编译的静态库，不依赖 pkg-config
        if let Ok(sysroot) = std::env::var("MUSL_SYSROOT") {
            println!("cargo:rustc-link-search=native={}/usr/lib", sysroot);
        }
        println!("cargo:rustc-link-lib=static=speexdsp");
        return;
    }

    // GNU 目标：ALSA 由 alsa-sys 处理，speexdsp 通过 pkg-config 查找
    pkg_config::Config::new()
        .probe("speexdsp")
        .expect("Failed to find speexdsp. Please install libspeexdsp-dev.");
}
