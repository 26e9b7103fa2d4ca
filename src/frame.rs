use log::{debug, info};
use std::path::PathBuf;

use crate::error::FrameError;
use crate::particles::DispatchGrid;
use crate::screenshot::Capture;

/// The steps of one frame, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStage {
    Dispatch,
    Barrier,
    Draw,
    Present,
    PollInput,
}

impl FrameStage {
    pub const CYCLE: [FrameStage; 5] = [
        FrameStage::Dispatch,
        FrameStage::Barrier,
        FrameStage::Draw,
        FrameStage::Present,
        FrameStage::PollInput,
    ];
}

/// GPU operations a frame is built from.
pub trait FrameBackend {
    /// Binds the compute program and its buffers and dispatches `grid`.
    fn dispatch_compute(&mut self, grid: DispatchGrid) -> Result<(), FrameError>;

    /// Makes every compute write issued so far visible to vertex reads that
    /// follow.
    fn memory_barrier(&mut self) -> Result<(), FrameError>;

    /// Binds the render program with the position buffer as vertex input and
    /// draws `count` points.
    fn draw_points(&mut self, count: u32) -> Result<(), FrameError>;

    /// Shows the frame. With `retain` set the backend keeps a copy that
    /// [`FrameBackend::read_frame`] can return.
    fn present(&mut self, retain: bool) -> Result<(), FrameError>;

    fn read_frame(&mut self) -> Result<Capture, FrameError>;
}

/// Input sampled between frames by the window event handler.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InputState {
    // Held, not edge-triggered: every frame it stays down writes a new file.
    pub screenshot: bool,
}

pub struct FrameLoop {
    pub grid: DispatchGrid,
    pub num_particles: u32,
    pub screenshot_path: PathBuf,
    frame_count: u64,
}

impl FrameLoop {
    pub fn new(grid: DispatchGrid, num_particles: u32, screenshot_path: PathBuf) -> Self {
        FrameLoop {
            grid,
            num_particles,
            screenshot_path,
            frame_count: 0,
        }
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Runs every stage of one frame against `backend`. The first failing
    /// stage ends the frame.
    pub fn run_frame<B: FrameBackend>(
        &mut self,
        backend: &mut B,
        input: &InputState,
    ) -> Result<(), FrameError> {
        for stage in FrameStage::CYCLE {
            self.run_stage(stage, backend, input)?;
        }
        self.frame_count += 1;
        Ok(())
    }

    fn run_stage<B: FrameBackend>(
        &self,
        stage: FrameStage,
        backend: &mut B,
        input: &InputState,
    ) -> Result<(), FrameError> {
        match stage {
            FrameStage::Dispatch => backend.dispatch_compute(self.grid),
            FrameStage::Barrier => backend.memory_barrier(),
            FrameStage::Draw => backend.draw_points(self.num_particles),
            FrameStage::Present => backend.present(input.screenshot),
            FrameStage::PollInput => {
                if input.screenshot {
                    debug!("Screenshot requested on frame {}", self.frame_count);
                    let capture = backend.read_frame()?;
                    capture.save(&self.screenshot_path)?;
                    info!("Saved frame {}", self.frame_count);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScreenshotError;
    use crate::screenshot::{PixelLayout, RowOrigin};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Dispatch(DispatchGrid),
        Barrier,
        Draw(u32),
        Present(bool),
        ReadFrame,
    }

    #[derive(Default)]
    struct RecordingBackend {
        calls: Vec<Call>,
        fail_dispatch: bool,
        fail_draw: Option<fn() -> FrameError>,
        no_capture: bool,
    }

    impl FrameBackend for RecordingBackend {
        fn dispatch_compute(&mut self, grid: DispatchGrid) -> Result<(), FrameError> {
            self.calls.push(Call::Dispatch(grid));
            if self.fail_dispatch {
                return Err(FrameError::OutOfMemory);
            }
            Ok(())
        }

        fn memory_barrier(&mut self) -> Result<(), FrameError> {
            self.calls.push(Call::Barrier);
            Ok(())
        }

        fn draw_points(&mut self, count: u32) -> Result<(), FrameError> {
            self.calls.push(Call::Draw(count));
            match self.fail_draw {
                Some(err) => Err(err()),
                None => Ok(()),
            }
        }

        fn present(&mut self, retain: bool) -> Result<(), FrameError> {
            self.calls.push(Call::Present(retain));
            Ok(())
        }

        fn read_frame(&mut self) -> Result<Capture, FrameError> {
            self.calls.push(Call::ReadFrame);
            if self.no_capture {
                return Err(ScreenshotError::Unsupported.into());
            }
            Ok(Capture {
                width: 8,
                height: 4,
                layout: PixelLayout::Rgba8,
                origin: RowOrigin::BottomLeft,
                pixels: vec![255; 8 * 4 * 4],
            })
        }
    }

    fn grid() -> DispatchGrid {
        DispatchGrid {
            width_units: 1024,
            height_units: 1,
        }
    }

    fn frame_loop(path: PathBuf) -> FrameLoop {
        FrameLoop::new(grid(), 1024, path)
    }

    #[test]
    fn stages_run_in_fixed_order() {
        let mut backend = RecordingBackend::default();
        let mut frames = frame_loop(PathBuf::from("unused.png"));
        frames
            .run_frame(&mut backend, &InputState::default())
            .unwrap();
        assert_eq!(
            backend.calls,
            vec![
                Call::Dispatch(grid()),
                Call::Barrier,
                Call::Draw(1024),
                Call::Present(false),
            ]
        );
        assert_eq!(frames.frame_count(), 1);
    }

    #[test]
    fn barrier_always_separates_dispatch_and_draw() {
        let mut backend = RecordingBackend::default();
        let mut frames = frame_loop(PathBuf::from("unused.png"));
        for _ in 0..10 {
            frames
                .run_frame(&mut backend, &InputState::default())
                .unwrap();
        }
        let mut since_dispatch: Option<bool> = None;
        for call in &backend.calls {
            match call {
                Call::Dispatch(_) => since_dispatch = Some(false),
                Call::Barrier => {
                    if let Some(seen) = since_dispatch.as_mut() {
                        *seen = true;
                    }
                }
                Call::Draw(_) => assert_eq!(since_dispatch, Some(true)),
                _ => {}
            }
        }
        let draws = backend
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Draw(1024)))
            .count();
        assert_eq!(draws, 10);
    }

    #[test]
    fn held_key_writes_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("screenshot.png");
        let mut backend = RecordingBackend::default();
        let mut frames = frame_loop(path.clone());
        let held = InputState { screenshot: true };

        frames.run_frame(&mut backend, &held).unwrap();
        assert_eq!(backend.calls[3], Call::Present(true));
        assert_eq!(backend.calls[4], Call::ReadFrame);
        assert!(path.exists());

        std::fs::remove_file(&path).unwrap();
        frames.run_frame(&mut backend, &held).unwrap();
        assert!(path.exists());
        let reads = backend
            .calls
            .iter()
            .filter(|c| **c == Call::ReadFrame)
            .count();
        assert_eq!(reads, 2);

        let written = image::open(&path).unwrap().into_rgba8();
        assert_eq!(written.dimensions(), (8, 4));
    }

    #[test]
    fn failed_dispatch_skips_the_rest_of_the_frame() {
        let mut backend = RecordingBackend {
            fail_dispatch: true,
            ..Default::default()
        };
        let mut frames = frame_loop(PathBuf::from("unused.png"));
        let err = frames
            .run_frame(&mut backend, &InputState::default())
            .unwrap_err();
        assert!(!err.is_recoverable());
        assert_eq!(backend.calls, vec![Call::Dispatch(grid())]);
        assert_eq!(frames.frame_count(), 0);
    }

    #[test]
    fn lost_surface_is_recoverable() {
        let mut backend = RecordingBackend {
            fail_draw: Some(|| FrameError::SurfaceLost),
            ..Default::default()
        };
        let mut frames = frame_loop(PathBuf::from("unused.png"));
        let err = frames
            .run_frame(&mut backend, &InputState::default())
            .unwrap_err();
        assert!(err.is_recoverable());
        assert!(!backend.calls.iter().any(|c| matches!(c, Call::Present(_))));
    }

    #[test]
    fn screenshot_failure_is_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("screenshot.png");
        let mut backend = RecordingBackend {
            no_capture: true,
            ..Default::default()
        };
        let mut frames = frame_loop(path.clone());
        let err = frames
            .run_frame(&mut backend, &InputState { screenshot: true })
            .unwrap_err();
        assert!(matches!(err, FrameError::Screenshot(_)));
        assert!(err.is_recoverable());
        assert!(!path.exists());
    }
}
