use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::fmt;
use std::str::FromStr;

pub type VideoId = i64;

/// A playlist entry backed by a media file in the videos directory.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Video {
    pub id: VideoId,
    pub title: String,
    pub filename: String,
    pub playlist_order: i64,
    #[serde(default)]
    pub file_size: u64,
    pub created_at: DateTime<Utc>,
}

impl Video {
    /// Playback ordering key; ties on `playlist_order` are broken by `id`.
    pub fn order_key(&self) -> (i64, VideoId) {
        (self.playlist_order, self.id)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Youtube,
    Twitch,
    Facebook,
    Custom,
}

impl Platform {
    pub fn default_ingest_url(&self) -> &'static str {
        match self {
            Platform::Youtube => "rtmp://a.rtmp.youtube.com/live2",
            Platform::Twitch => "rtmp://live.twitch.tv/app",
            Platform::Facebook => "rtmps://live-api-s.facebook.com:443/rtmp",
            Platform::Custom => "",
        }
    }
}

/// Output resolution; `Native` keeps the source dimensions and skips scaling.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub enum Resolution {
    Native,
    Scaled { width: u32, height: u32 },
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Resolution::Scaled { width, height }
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if ["native", "source", "original"]
            .iter()
            .any(|sentinel| s.eq_ignore_ascii_case(sentinel))
        {
            return Ok(Resolution::Native);
        }

        let Some((w, h)) = s.split_once(['x', 'X']) else {
            return Err(format!("Invalid resolution '{s}'. Use WxH or 'native'"));
        };
        let width = w
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("Invalid resolution width '{w}'"))?;
        let height = h
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("Invalid resolution height '{h}'"))?;
        if width == 0 || height == 0 {
            return Err(format!("Resolution must be positive, got {width}x{height}"));
        }

        Ok(Resolution::Scaled { width, height })
    }
}

impl TryFrom<String> for Resolution {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(resolution: Resolution) -> Self {
        resolution.to_string()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Native => f.write_str("native"),
            Resolution::Scaled { width, height } => write!(f, "{width}x{height}"),
        }
    }
}

/// Platform and quality settings read by the command builder at spawn time.
///
/// Accepts both the camelCase names used by the control panel and their
/// snake_case spellings; unknown fields are rejected.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StreamConfig {
    pub platform: Platform,
    #[serde(alias = "stream_key")]
    pub stream_key: String,
    #[serde(alias = "rtmp_url")]
    pub rtmp_url: String,
    pub resolution: Resolution,
    pub framerate: u32,
    /// Video bitrate in kbps
    #[serde(rename = "bitrate", alias = "videoBitrateKbps")]
    pub video_bitrate_kbps: u32,
    /// Audio bitrate in kbps
    #[serde(rename = "audioQuality", alias = "audio_quality")]
    pub audio_bitrate_kbps: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let platform = Platform::default();
        Self {
            platform,
            stream_key: String::new(),
            rtmp_url: platform.default_ingest_url().to_string(),
            resolution: Resolution::new(1920, 1080),
            framerate: 30,
            video_bitrate_kbps: 2500,
            audio_bitrate_kbps: 128,
        }
    }
}

/// Deployment settings persisted for the control panel.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemConfig {
    #[serde(alias = "rtmp_port")]
    pub rtmp_port: u16,
    #[serde(alias = "web_port")]
    pub web_port: u16,
    #[serde(alias = "db_host")]
    pub db_host: String,
    #[serde(alias = "db_port")]
    pub db_port: u16,
    #[serde(alias = "db_name")]
    pub db_name: String,
    #[serde(alias = "db_user")]
    pub db_user: String,
    #[serde(alias = "db_password")]
    pub db_password: String,
    #[serde(alias = "use_external_db")]
    pub use_external_db: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            rtmp_port: 1935,
            web_port: 5000,
            db_host: "localhost".into(),
            db_port: 5432,
            db_name: "streaming_db".into(),
            db_user: String::new(),
            db_password: String::new(),
            use_external_db: false,
        }
    }
}

/// Serialize `value` and add a snake_case twin for every camelCase key, so
/// clients reading either spelling see the same settings.
pub fn with_snake_case_keys<T: Serialize>(value: &T) -> serde_json::Result<JsonValue> {
    let JsonValue::Object(map) = serde_json::to_value(value)? else {
        return serde_json::to_value(value);
    };

    let mut out = JsonMap::with_capacity(map.len() * 2);
    for (key, value) in map {
        let snake = to_snake_case(&key);
        if snake != key {
            out.insert(snake, value.clone());
        }
        out.insert(key, value);
    }
    Ok(JsonValue::Object(out))
}

fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_parse() {
        assert_eq!("1280x720".parse(), Ok(Resolution::new(1280, 720)));
        assert_eq!(" 1920X1080 ".parse(), Ok(Resolution::new(1920, 1080)));
        assert_eq!("native".parse(), Ok(Resolution::Native));
        assert_eq!("Source".parse(), Ok(Resolution::Native));

        assert!("0x720".parse::<Resolution>().is_err());
        assert!("1280".parse::<Resolution>().is_err());
        assert!("-1x720".parse::<Resolution>().is_err());
        assert!("widexhigh".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_stream_config_accepts_panel_payload() {
        let payload = r#"{
            "platform": "youtube",
            "streamKey": "test-key-123",
            "rtmpUrl": "rtmp://a.rtmp.youtube.com/live2",
            "resolution": "1280x720",
            "framerate": 30,
            "bitrate": 2500,
            "audioQuality": 128
        }"#;

        let config: StreamConfig = serde_json::from_str(payload).unwrap();
        assert_eq!(config.platform, Platform::Youtube);
        assert_eq!(config.stream_key, "test-key-123");
        assert_eq!(config.resolution, Resolution::new(1280, 720));
        assert_eq!(config.video_bitrate_kbps, 2500);
        assert_eq!(config.audio_bitrate_kbps, 128);
    }

    #[test]
    fn test_stream_config_accepts_snake_case_aliases() {
        let payload = r#"{
            "platform": "twitch",
            "stream_key": "live_abc",
            "rtmp_url": "rtmp://live.twitch.tv/app",
            "resolution": "native",
            "framerate": 60,
            "bitrate": 6000,
            "audio_quality": 160
        }"#;

        let config: StreamConfig = serde_json::from_str(payload).unwrap();
        assert_eq!(config.platform, Platform::Twitch);
        assert_eq!(config.stream_key, "live_abc");
        assert_eq!(config.resolution, Resolution::Native);
    }

    #[test]
    fn test_stream_config_rejects_malformed_input() {
        let unknown_field = r#"{
            "platform": "youtube", "streamKey": "k", "rtmpUrl": "rtmp://x",
            "resolution": "1280x720", "framerate": 30, "bitrate": 2500,
            "audioQuality": 128, "preset": "ultrafast"
        }"#;
        assert!(serde_json::from_str::<StreamConfig>(unknown_field).is_err());

        let negative_bitrate = r#"{
            "platform": "youtube", "streamKey": "k", "rtmpUrl": "rtmp://x",
            "resolution": "1280x720", "framerate": 30, "bitrate": -1,
            "audioQuality": 128
        }"#;
        assert!(serde_json::from_str::<StreamConfig>(negative_bitrate).is_err());

        let unknown_platform = r#"{
            "platform": "myspace", "streamKey": "k", "rtmpUrl": "rtmp://x",
            "resolution": "1280x720", "framerate": 30, "bitrate": 2500,
            "audioQuality": 128
        }"#;
        assert!(serde_json::from_str::<StreamConfig>(unknown_platform).is_err());
    }

    #[test]
    fn test_dual_case_keys() {
        let config = StreamConfig {
            stream_key: "sk_live_test123".into(),
            ..Default::default()
        };
        let value = with_snake_case_keys(&config).unwrap();

        assert_eq!(value["streamKey"], "sk_live_test123");
        assert_eq!(value["stream_key"], "sk_live_test123");
        assert_eq!(value["audioQuality"], 128);
        assert_eq!(value["audio_quality"], 128);
        assert_eq!(value["resolution"], "1920x1080");

        let system = with_snake_case_keys(&SystemConfig::default()).unwrap();
        assert_eq!(system["rtmpPort"], 1935);
        assert_eq!(system["rtmp_port"], 1935);
        assert_eq!(system["use_external_db"], false);
    }

    #[test]
    fn test_system_config_partial_payload_uses_defaults() {
        let config: SystemConfig =
            serde_json::from_str(r#"{ "rtmpPort": 1936, "web_port": 5001 }"#).unwrap();
        assert_eq!(config.rtmp_port, 1936);
        assert_eq!(config.web_port, 5001);
        assert_eq!(config.db_name, "streaming_db");
    }
}
