use std::path::PathBuf;

use crate::errors::{CaptureError, CaptureResult};
use crate::format::OutputFormat;

pub const DEFAULT_FPS: f64 = 60.0;

/// Session-level configuration.
#[derive(Clone, Debug)]
pub struct CaptureOptions {
    pub fps: Option<f64>,
    /// `WxH`, passed to the encoder as the output size.
    pub size: Option<String>,
    pub format: Option<OutputFormat>,
    /// Encoder executable; discovered when unset.
    pub encoder_path: Option<PathBuf>,
    /// Applied after `format`.
    pub custom_encoder_config: Option<OutputFormat>,
    /// Used by [`crate::capture`] only.
    pub attach_on_create: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            fps: Some(DEFAULT_FPS),
            size: None,
            format: Some(OutputFormat::default()),
            encoder_path: None,
            custom_encoder_config: None,
            attach_on_create: true,
        }
    }
}

impl CaptureOptions {
    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = Some(fps);
        self
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = Some(size.into());
        self
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_encoder_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.encoder_path = Some(path.into());
        self
    }

    pub fn with_custom_encoder_config(mut self, config: OutputFormat) -> Self {
        self.custom_encoder_config = Some(config);
        self
    }

    /// Validated frame rate.
    pub fn resolved_fps(&self) -> CaptureResult<f64> {
        let fps = self
            .fps
            .ok_or_else(|| CaptureError::configuration("options.fps needs to be set"))?;
        if fps.is_nan() || fps < 0.0 {
            return Err(CaptureError::configuration(format!(
                "options.fps can not be set to {fps}"
            )));
        }
        Ok(fps)
    }
}

/// Per-start configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StartOptions {
    pub wait_for_first_frame: Option<bool>,
    pub drop_captured_frames: Option<bool>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            wait_for_first_frame: Some(true),
            drop_captured_frames: Some(false),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ResolvedStartOptions {
    pub wait_for_first_frame: bool,
    pub drop_captured_frames: bool,
}

impl StartOptions {
    pub fn wait_for_first_frame(mut self, flag: bool) -> Self {
        self.wait_for_first_frame = Some(flag);
        self
    }

    pub fn drop_captured_frames(mut self, flag: bool) -> Self {
        self.drop_captured_frames = Some(flag);
        self
    }

    pub(crate) fn resolve(self) -> CaptureResult<ResolvedStartOptions> {
        let wait_for_first_frame = self.wait_for_first_frame.ok_or_else(|| {
            CaptureError::configuration("options.wait_for_first_frame can not be null or undefined")
        })?;
        let drop_captured_frames = self.drop_captured_frames.ok_or_else(|| {
            CaptureError::configuration("options.drop_captured_frames can not be null or undefined")
        })?;
        Ok(ResolvedStartOptions {
            wait_for_first_frame,
            drop_captured_frames,
        })
    }
}
