//! Encoder command model and output format presets.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Input and output description of one encoder run, rendered to an argument vector.
#[derive(Clone, Debug, PartialEq)]
pub struct EncoderCommand {
    pub input_format: String,
    pub input_fps: f64,
    pub threads: usize,
    pub output_fps: f64,
    pub size: Option<String>,
    pub output_format: Option<String>,
    pub video_codec: Option<String>,
    pub output_options: Vec<String>,
    pub output: String,
}

impl EncoderCommand {
    pub fn new(fps: f64, size: Option<String>, output: impl Into<String>) -> Self {
        Self {
            input_format: "image2pipe".into(),
            input_fps: fps,
            threads: 1,
            output_fps: fps,
            size,
            output_format: None,
            video_codec: None,
            output_options: Vec::new(),
            output: output.into(),
        }
    }

    pub fn output_format(&mut self, format: impl Into<String>) -> &mut Self {
        self.output_format = Some(format.into());
        self
    }

    pub fn video_codec(&mut self, codec: impl Into<String>) -> &mut Self {
        self.video_codec = Some(codec.into());
        self
    }

    /// Add a raw output option; `"-preset fast"` is split into flag and value.
    pub fn output_option(&mut self, option: &str) -> &mut Self {
        match option.split_once(' ') {
            Some((flag, value)) => {
                self.output_options.push(flag.to_string());
                self.output_options.push(value.trim().to_string());
            }
            None => self.output_options.push(option.to_string()),
        }
        self
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            self.input_format.clone(),
            "-framerate".into(),
            self.input_fps.to_string(),
            "-i".into(),
            "pipe:0".into(),
            "-threads".into(),
            self.threads.to_string(),
        ];
        if let Some(format) = &self.output_format {
            args.push("-f".into());
            args.push(format.clone());
        }
        if let Some(codec) = &self.video_codec {
            args.push("-c:v".into());
            args.push(codec.clone());
        }
        args.extend(self.output_options.iter().cloned());
        args.push("-r".into());
        args.push(self.output_fps.to_string());
        if let Some(size) = &self.size {
            args.push("-s".into());
            args.push(size.clone());
        }
        args.push("-y".into());
        args.push(self.output.clone());
        args
    }
}

/// Configurator applied to an [`EncoderCommand`] before launch.
#[derive(Clone)]
pub struct OutputFormat {
    name: String,
    apply: Arc<dyn Fn(&mut EncoderCommand) + Send + Sync>,
}

impl OutputFormat {
    pub fn new<F>(name: impl Into<String>, apply: F) -> Self
    where
        F: Fn(&mut EncoderCommand) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            apply: Arc::new(apply),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn apply(&self, command: &mut EncoderCommand) {
        (self.apply)(command)
    }
}

impl fmt::Debug for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputFormat").field("name", &self.name).finish()
    }
}

/// x264 speed presets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    #[default]
    Ultrafast,
    Superfast,
    Veryfast,
    Faster,
    Fast,
    Medium,
    Slow,
    Slower,
    Veryslow,
}

impl Preset {
    pub fn as_str(self) -> &'static str {
        match self {
            Preset::Ultrafast => "ultrafast",
            Preset::Superfast => "superfast",
            Preset::Veryfast => "veryfast",
            Preset::Faster => "faster",
            Preset::Fast => "fast",
            Preset::Medium => "medium",
            Preset::Slow => "slow",
            Preset::Slower => "slower",
            Preset::Veryslow => "veryslow",
        }
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value.to_ascii_lowercase().as_str() {
            "ultrafast" => Preset::Ultrafast,
            "superfast" => Preset::Superfast,
            "veryfast" => Preset::Veryfast,
            "faster" => Preset::Faster,
            "fast" => Preset::Fast,
            "medium" => Preset::Medium,
            "slow" => Preset::Slow,
            "slower" => Preset::Slower,
            "veryslow" => Preset::Veryslow,
            other => return Err(format!("unknown preset '{other}'")),
        })
    }
}

pub const DEFAULT_VIDEO_CODEC: &str = "libx264";

/// Fragmented MP4, writable to a non-seekable sink.
pub fn mp4(preset: Preset, video_codec: &str) -> OutputFormat {
    let codec = video_codec.to_string();
    OutputFormat::new(format!("mp4/{codec}/{}", preset.as_str()), move |command| {
        command
            .output_format("mp4")
            .video_codec(codec.clone())
            .output_option(&format!("-preset {}", preset.as_str()))
            .output_option("-movflags +frag_keyframe+separate_moof+omit_tfhd_offset+empty_moov");
    })
}

impl Default for OutputFormat {
    fn default() -> Self {
        mp4(Preset::default(), DEFAULT_VIDEO_CODEC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mp4_renders_streamable_args() {
        let mut command = EncoderCommand::new(30.0, None, "out.mp4");
        OutputFormat::default().apply(&mut command);
        let args = command.to_args();
        let joined = args.join(" ");
        assert!(joined.contains("-f image2pipe -framerate 30 -i pipe:0"));
        assert!(joined.contains("-f mp4 -c:v libx264 -preset ultrafast"));
        assert!(joined.contains("-movflags +frag_keyframe+separate_moof+omit_tfhd_offset+empty_moov"));
        assert!(joined.ends_with("-r 30 -y out.mp4"));
        assert!(!args.iter().any(|arg| arg == "-s"));
    }

    #[test]
    fn custom_configurator_overrides_format() {
        let mut command = EncoderCommand::new(60.0, Some("640x480".into()), "pipe:1");
        mp4(Preset::Slow, "libx265").apply(&mut command);
        OutputFormat::new("custom", |command| {
            command.video_codec("mpeg4");
        })
        .apply(&mut command);
        assert_eq!(command.video_codec.as_deref(), Some("mpeg4"));
        let args = command.to_args();
        let size_at = args.iter().position(|arg| arg == "-s").unwrap();
        assert_eq!(args[size_at + 1], "640x480");
        assert!(args.windows(2).any(|pair| pair == ["-preset", "slow"]));
    }

    #[test]
    fn presets_parse_case_insensitively() {
        assert_eq!("VeryFast".parse::<Preset>(), Ok(Preset::Veryfast));
        assert!("warp".parse::<Preset>().is_err());
    }
}
