//! Video output: frame validation, texture-upload planning and the surface seam.
//!
//! The GPU work itself lives behind [`RenderSurface`]. This module decides *what* to
//! upload for a decoded frame:
//! - [`RendererKind::for_format`] picks the one renderer variant for a pixel format
//! - [`FrameRenderer`] validates planes, derives one [`TextureUpload`] per plane and
//!   tracks geometry (size and sample aspect ratio) changes
//! - [`VideoOutHandler`] serializes frame delivery against surface replacement
//!
//! Texture widths always follow the plane's **row stride**, not the visible width. The
//! padding columns are hidden by cropping texture coordinates to
//! `visible_width / buffer_width`.

use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow, bail, ensure};

/// Decoded pixel layouts an engine may hand over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Yuv420p,
    Nv12,
    Nv21,
    Yuv422p,
    /// Packed 4:2:2, must be converted to planar by the engine.
    Yuyv422,
    /// Packed 4:2:2, must be converted to planar by the engine.
    Uyvy422,
    /// Must be converted to 4:2:0 by the engine.
    Yuv444p,
    Rgb24,
    Bgr24,
    Rgba,
    Bgra,
    Argb,
    Abgr,
    Rgb565,
    Bgr565,
}

/// Renderer variant. One per family of pixel layouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RendererKind {
    /// Three planes, chroma subsampled 2x2.
    Yuv420p,
    /// Three planes, chroma subsampled horizontally.
    Yuv422p,
    /// Luma plane plus interleaved UV plane.
    Nv12,
    /// Luma plane plus interleaved VU plane.
    Nv21,
    /// Single packed plane.
    Rgb { bytes_per_pixel: u32 },
}

impl RendererKind {
    /// Renderer for `format`, or an error if the engine must convert first.
    pub fn for_format(format: PixelFormat) -> Result<Self> {
        let kind = match format {
            PixelFormat::Yuv420p => RendererKind::Yuv420p,
            PixelFormat::Yuv422p => RendererKind::Yuv422p,
            PixelFormat::Nv12 => RendererKind::Nv12,
            PixelFormat::Nv21 => RendererKind::Nv21,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => RendererKind::Rgb { bytes_per_pixel: 3 },
            PixelFormat::Rgba | PixelFormat::Bgra | PixelFormat::Argb | PixelFormat::Abgr => {
                RendererKind::Rgb { bytes_per_pixel: 4 }
            }
            PixelFormat::Rgb565 | PixelFormat::Bgr565 => RendererKind::Rgb { bytes_per_pixel: 2 },
            PixelFormat::Yuyv422 | PixelFormat::Uyvy422 | PixelFormat::Yuv444p => {
                bail!("pixel format {format:?} needs conversion before rendering")
            }
        };
        Ok(kind)
    }

    pub fn plane_count(self) -> usize {
        match self {
            RendererKind::Yuv420p | RendererKind::Yuv422p => 3,
            RendererKind::Nv12 | RendererKind::Nv21 => 2,
            RendererKind::Rgb { .. } => 1,
        }
    }

    /// `(bytes_per_texel, visible_row_bytes, rows)` for plane `index` of a `w`x`h` frame.
    fn plane_layout(self, index: usize, w: u32, h: u32) -> (u32, u32, u32) {
        let half_w = w.div_ceil(2);
        let half_h = h.div_ceil(2);
        match (self, index) {
            (RendererKind::Rgb { bytes_per_pixel }, _) => (bytes_per_pixel, w * bytes_per_pixel, h),
            (_, 0) => (1, w, h),
            (RendererKind::Yuv420p, _) => (1, half_w, half_h),
            (RendererKind::Yuv422p, _) => (1, half_w, h),
            (RendererKind::Nv12 | RendererKind::Nv21, _) => (2, half_w * 2, half_h),
        }
    }
}

/// One image plane with its row stride in bytes.
#[derive(Clone, Debug, Default)]
pub struct Plane {
    pub data: Vec<u8>,
    pub stride: usize,
}

/// A decoded picture ready for display.
#[derive(Clone, Debug)]
pub struct VideoFrame {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Sample aspect ratio as `(num, den)`; `(0, 1)` when unknown.
    pub sar: (i32, i32),
    pub planes: Vec<Plane>,
}

/// Upload instructions for one plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureUpload {
    pub plane: usize,
    /// Texture width in texels; equals the row stride.
    pub width: u32,
    pub height: u32,
    pub bytes_per_texel: u32,
}

/// Everything a surface needs to draw one frame.
#[derive(Debug)]
pub struct RenderPass<'a> {
    pub kind: RendererKind,
    pub frame: &'a VideoFrame,
    pub uploads: Vec<TextureUpload>,
    /// Right edge of the visible region in texture coordinates.
    pub crop_right: f32,
    /// Set when size or SAR differ from the previous frame; vertices must be rebuilt.
    pub geometry_changed: bool,
}

/// Platform drawing target (window + graphics context).
pub trait RenderSurface: Send {
    /// Upload and draw. Returning `Err` drops the frame.
    fn render(&mut self, pass: &RenderPass<'_>) -> Result<()>;

    /// Release context resources before the surface is dropped or replaced.
    fn terminate(&mut self) {}
}

/// Per-stream renderer state; survives surface changes.
#[derive(Debug, Default)]
pub struct FrameRenderer {
    format: Option<PixelFormat>,
    kind: Option<RendererKind>,
    geometry: Option<(u32, u32, (i32, i32))>,
    last_buffer_width: u32,
}

impl FrameRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(&self) -> Option<RendererKind> {
        self.kind
    }

    /// Buffer (stride) width of the last rendered frame, in texels.
    pub fn last_buffer_width(&self) -> u32 {
        self.last_buffer_width
    }

    /// Force the next frame to report a geometry change.
    pub fn invalidate_geometry(&mut self) {
        self.geometry = None;
    }

    /// Plan the uploads for `frame` without drawing.
    pub fn prepare<'a>(&mut self, frame: &'a VideoFrame) -> Result<RenderPass<'a>> {
        ensure!(frame.width > 0 && frame.height > 0, "empty frame {}x{}", frame.width, frame.height);

        if self.format != Some(frame.format) {
            let kind = RendererKind::for_format(frame.format)?;
            tracing::info!(format = ?frame.format, ?kind, "video renderer selected");
            self.format = Some(frame.format);
            self.kind = Some(kind);
            self.geometry = None;
        }
        let kind = self.kind.ok_or_else(|| anyhow!("no renderer selected"))?;

        ensure!(
            frame.planes.len() >= kind.plane_count(),
            "{:?} frame has {} planes, need {}",
            frame.format,
            frame.planes.len(),
            kind.plane_count()
        );

        let mut uploads = Vec::with_capacity(kind.plane_count());
        for (index, plane) in frame.planes.iter().take(kind.plane_count()).enumerate() {
            let (texel, row_bytes, rows) = kind.plane_layout(index, frame.width, frame.height);
            ensure!(
                plane.stride >= row_bytes as usize,
                "plane {index} stride {} shorter than row {row_bytes}",
                plane.stride
            );
            let needed = plane.stride * (rows as usize - 1) + row_bytes as usize;
            ensure!(
                plane.data.len() >= needed,
                "plane {index} holds {} bytes, need {needed}",
                plane.data.len()
            );
            uploads.push(TextureUpload {
                plane: index,
                width: (plane.stride / texel as usize) as u32,
                height: rows,
                bytes_per_texel: texel,
            });
        }

        let buffer_width = match kind {
            RendererKind::Rgb { .. } => uploads[0].width,
            _ => frame.planes[0].stride as u32,
        };
        self.last_buffer_width = buffer_width;

        let geometry = (frame.width, frame.height, frame.sar);
        let geometry_changed = self.geometry != Some(geometry);
        if geometry_changed {
            tracing::debug!(
                width = frame.width,
                height = frame.height,
                sar_num = frame.sar.0,
                sar_den = frame.sar.1,
                buffer_width,
                "video geometry changed"
            );
            self.geometry = Some(geometry);
        }

        Ok(RenderPass {
            kind,
            frame,
            uploads,
            crop_right: frame.width as f32 / buffer_width.max(1) as f32,
            geometry_changed,
        })
    }
}

struct VideoOut {
    surface: Option<Box<dyn RenderSurface>>,
    renderer: FrameRenderer,
    frames_rendered: u64,
}

/// Owns the (surface, renderer) pair and serializes access to it.
pub struct VideoOutHandler {
    inner: Mutex<VideoOut>,
}

impl Default for VideoOutHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoOutHandler {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VideoOut {
                surface: None,
                renderer: FrameRenderer::new(),
                frames_rendered: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VideoOut> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the drawing target atomically with respect to `display_image`.
    ///
    /// The previous surface is terminated. Renderer state is kept, but the next frame
    /// reports a geometry change so the new surface sets up its vertices.
    pub fn set_surface(&self, surface: Option<Box<dyn RenderSurface>>) {
        let mut g = self.lock();
        if let Some(mut old) = g.surface.take() {
            old.terminate();
        }
        g.renderer.invalidate_geometry();
        tracing::info!(attached = surface.is_some(), "video surface changed");
        g.surface = surface;
    }

    pub fn has_surface(&self) -> bool {
        self.lock().surface.is_some()
    }

    /// Render `frame`. Returns `false` if there is no surface or rendering failed.
    pub fn display_image(&self, frame: &VideoFrame) -> bool {
        let mut g = self.lock();
        let VideoOut {
            surface,
            renderer,
            frames_rendered,
        } = &mut *g;
        let Some(surface) = surface.as_mut() else {
            tracing::debug!("display_image without surface");
            return false;
        };
        let result = renderer.prepare(frame).and_then(|pass| surface.render(&pass));
        match result {
            Ok(()) => {
                *frames_rendered += 1;
                true
            }
            Err(e) => {
                tracing::warn!(
                    width = frame.width,
                    height = frame.height,
                    format = ?frame.format,
                    "display_image failed: {e:#}"
                );
                false
            }
        }
    }

    pub fn frames_rendered(&self) -> u64 {
        self.lock().frames_rendered
    }

    /// Terminate and drop the surface. The renderer is kept for reuse.
    pub fn release_resources(&self) {
        let mut g = self.lock();
        if let Some(mut surface) = g.surface.take() {
            surface.terminate();
            tracing::info!("video surface released");
        }
    }
}
