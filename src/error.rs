use std::path::PathBuf;
use thiserror::Error;

/// Failures while bringing the scene up. None of these are retried; the
/// binary logs them and exits.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid parameters: {0}")]
    Params(String),

    #[error("failed to create window: {0}")]
    Window(String),

    #[error("failed to create surface: {0}")]
    Surface(#[from] wgpu::CreateSurfaceError),

    #[error("no suitable GPU adapter found")]
    NoAdapter,

    #[error("failed to acquire device: {0}")]
    Device(#[from] wgpu::RequestDeviceError),

    #[error("failed to read shader {}: {source}", path.display())]
    ShaderIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to compile {}:\n---\n{text}---\n{log}", path.display())]
    ShaderCompile {
        path: PathBuf,
        text: String,
        log: String,
    },

    #[error("failed to link program '{program}': {log}")]
    Link { program: String, log: String },

    #[error("shader interface mismatch in '{program}': {detail}")]
    Interface { program: String, detail: String },

    #[error("pipeline '{label}' rejected by the device: {log}")]
    Pipeline { label: String, log: String },
}

/// Failures while producing a single frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("surface lost or outdated")]
    SurfaceLost,

    #[error("timed out acquiring the next surface texture")]
    Timeout,

    #[error("out of GPU memory")]
    OutOfMemory,

    #[error("screenshot failed: {0}")]
    Screenshot(#[from] ScreenshotError),
}

impl FrameError {
    /// Whether the frame loop may skip this frame and continue.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FrameError::OutOfMemory)
    }
}

impl From<wgpu::SurfaceError> for FrameError {
    fn from(err: wgpu::SurfaceError) -> Self {
        match err {
            wgpu::SurfaceError::Timeout => FrameError::Timeout,
            wgpu::SurfaceError::OutOfMemory => FrameError::OutOfMemory,
            _ => FrameError::SurfaceLost,
        }
    }
}

#[derive(Debug, Error)]
pub enum ScreenshotError {
    #[error("surface does not allow copying frames out")]
    Unsupported,

    #[error("no frame was retained for capture")]
    NothingRetained,

    #[error("failed to map readback buffer: {0}")]
    Map(#[from] wgpu::BufferAsyncError),

    #[error("readback callback was dropped")]
    Disconnected,

    #[error("pixel data is {actual} bytes, expected {expected}")]
    Size { expected: usize, actual: usize },

    #[error("failed to encode {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_out_of_memory_is_fatal() {
        assert!(FrameError::SurfaceLost.is_recoverable());
        assert!(FrameError::Timeout.is_recoverable());
        assert!(FrameError::Screenshot(ScreenshotError::Unsupported).is_recoverable());
        assert!(!FrameError::OutOfMemory.is_recoverable());
    }

    #[test]
    fn surface_errors_map_onto_frame_errors() {
        assert!(matches!(
            FrameError::from(wgpu::SurfaceError::Outdated),
            FrameError::SurfaceLost
        ));
        assert!(matches!(
            FrameError::from(wgpu::SurfaceError::Lost),
            FrameError::SurfaceLost
        ));
        assert!(matches!(
            FrameError::from(wgpu::SurfaceError::Timeout),
            FrameError::Timeout
        ));
        assert!(matches!(
            FrameError::from(wgpu::SurfaceError::OutOfMemory),
            FrameError::OutOfMemory
        ));
    }

    #[test]
    fn compile_error_embeds_source_and_log() {
        let err = SetupError::ShaderCompile {
            path: PathBuf::from("shaders/broken.wgsl"),
            text: "fn main( {".to_string(),
            log: "expected ')'".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("shaders/broken.wgsl"));
        assert!(message.contains("fn main( {"));
        assert!(message.contains("expected ')'"));
    }
}
