//! Buffer classification and image binding
//!
//! Turns an opaque client buffer into something the host can display. A
//! committed buffer is classified by its tagged [`BufferSource`] (wl_shm pool
//! memory vs dmabuf planes); the shm path copies pixels out into RGBA8888 and
//! releases the buffer immediately, while the GPU path passes duplicated
//! plane fds through and holds the buffer until it is replaced or destroyed.
//!
//! The two paths deliberately differ in memoization: rebinding the same
//! dmabuf identity is a no-op, rebinding a shm buffer always reconverts.
//! Released shm memory may be rewritten by the client at any moment, so its
//! bytes can never be cached by identity.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use log::{debug, trace};
use memmap2::Mmap;
use thiserror::Error;
use wayland_server::protocol::wl_shm;
use wayland_server::WEnum;

use crate::view::{BufferId, GpuPlane, ImageHandle, ViewId, ViewManager};

/// One dmabuf plane as handed over by the client.
#[derive(Debug)]
pub struct DmabufPlane {
    pub fd: OwnedFd,
    pub offset: u32,
    pub stride: u32,
}

/// Backing storage of a client buffer.
pub enum BufferSource {
    Shm {
        map: Arc<Mmap>,
        stride: i32,
        offset: i32,
        format: WEnum<wl_shm::Format>,
    },
    Dmabuf {
        planes: Vec<DmabufPlane>,
        fourcc: u32,
        modifier: u64,
    },
}

/// Classification of a buffer's backing kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Shm,
    Gpu,
}

/// A client buffer known to the server.
pub struct BufferRecord {
    pub id: BufferId,
    pub width: i32,
    pub height: i32,
    pub source: BufferSource,
}

impl BufferRecord {
    pub fn kind(&self) -> BufferKind {
        match self.source {
            BufferSource::Shm { .. } => BufferKind::Shm,
            BufferSource::Dmabuf { .. } => BufferKind::Gpu,
        }
    }
}

/// Non-fatal presentation failures; the caller reports them to the client
/// as a (0, 0) buffer rejection.
#[derive(Debug, Error)]
pub enum PresentError {
    #[error("surface has no committed buffer")]
    NoBuffer,
    #[error("no record for buffer {0}")]
    UnknownBuffer(BufferId),
    #[error("buffer {0} has invalid geometry")]
    Geometry(BufferId),
    #[error("buffer {0} pixels are not convertible")]
    Convert(BufferId),
    #[error("dmabuf plane dup failed: {0}")]
    PlaneDup(#[from] std::io::Error),
}

/// Result of a successful bind.
#[derive(Debug, PartialEq, Eq)]
pub struct BindOutcome {
    pub width: u32,
    pub height: u32,
    /// False when the memoized GPU identity made the bind a no-op.
    pub rebuilt: bool,
    /// Buffer ids whose wl_buffer.release must be sent now, in order.
    pub release: Vec<BufferId>,
}

/// Binds a surface's committed buffer to its view.
///
/// Swaps the view's single image slot, updates the extent when the size
/// changed, and reports which buffers can be released. The previously held
/// GPU buffer (if any) is always listed before the new buffer so releases
/// go out oldest-first.
pub fn bind_buffer(
    views: &mut ViewManager,
    view_id: ViewId,
    record: Option<&BufferRecord>,
) -> Result<BindOutcome, PresentError> {
    let rec = record.ok_or(PresentError::NoBuffer)?;
    if rec.width <= 0 || rec.height <= 0 {
        return Err(PresentError::Geometry(rec.id));
    }
    let width = rec.width as u32;
    let height = rec.height as u32;

    let prior_held = views.view(view_id).and_then(|v| v.last_gpu_buffer());
    let mut release = Vec::new();

    let rebuilt = match &rec.source {
        BufferSource::Shm { .. } => {
            let pixels = convert_shm_to_rgba(rec).ok_or(PresentError::Convert(rec.id))?;
            if let Some(prior) = prior_held {
                if prior != rec.id {
                    release.push(prior);
                }
            }
            views.set_image(
                view_id,
                ImageHandle::Shm {
                    pixels: Arc::new(pixels),
                    width,
                    height,
                },
            );
            // Pixels are copied out; the client may reuse the pool at once.
            release.push(rec.id);
            true
        }
        BufferSource::Dmabuf {
            planes,
            fourcc,
            modifier,
        } => {
            if prior_held == Some(rec.id) {
                trace!("View {} rebind of dmabuf {} is a no-op", view_id, rec.id);
                views.set_size(view_id, width, height);
                return Ok(BindOutcome {
                    width,
                    height,
                    rebuilt: false,
                    release,
                });
            }
            let mut gpu_planes = Vec::with_capacity(planes.len());
            for plane in planes {
                gpu_planes.push(GpuPlane {
                    fd: plane.fd.try_clone()?,
                    offset: plane.offset,
                    stride: plane.stride,
                });
            }
            if let Some(prior) = prior_held {
                release.push(prior);
            }
            views.set_image(
                view_id,
                ImageHandle::Gpu {
                    planes: Arc::new(gpu_planes),
                    fourcc: *fourcc,
                    modifier: *modifier,
                    width,
                    height,
                },
            );
            views.set_last_gpu_buffer(view_id, Some(rec.id));
            true
        }
    };

    if views.set_size(view_id, width, height) {
        debug!("View {} resized to {}x{}", view_id, width, height);
    }

    Ok(BindOutcome {
        width,
        height,
        rebuilt,
        release,
    })
}

fn convert_shm_to_rgba(rec: &BufferRecord) -> Option<Vec<u8>> {
    let width = rec.width.max(0) as usize;
    let height = rec.height.max(0) as usize;
    let (stride, offset, format, map) = match &rec.source {
        BufferSource::Shm {
            map,
            stride,
            offset,
            format,
        } => (*stride as usize, *offset as usize, *format, map.clone()),
        _ => return None,
    };
    if width == 0 || height == 0 || stride < width.checked_mul(4)? {
        return None;
    }
    let needed = offset.checked_add(stride.checked_mul(height)?)?;
    if needed > map.len() {
        return None;
    }
    let src = &map[offset..offset + stride * height];
    let mut out = vec![0u8; width.checked_mul(height)?.checked_mul(4)?];
    // wl_shm formats are little-endian
    match format {
        WEnum::Value(wl_shm::Format::Xrgb8888) => {
            for y in 0..height {
                let row = &src[y * stride..y * stride + width * 4];
                for x in 0..width {
                    let i = x * 4;
                    let o = (y * width + x) * 4;
                    out[o] = row[i + 2];
                    out[o + 1] = row[i + 1];
                    out[o + 2] = row[i];
                    out[o + 3] = 255;
                }
            }
        }
        WEnum::Value(wl_shm::Format::Argb8888) => {
            for y in 0..height {
                let row = &src[y * stride..y * stride + width * 4];
                for x in 0..width {
                    let i = x * 4;
                    let o = (y * width + x) * 4;
                    out[o] = row[i + 2];
                    out[o + 1] = row[i + 1];
                    out[o + 2] = row[i];
                    out[o + 3] = row[i + 3];
                }
            }
        }
        WEnum::Value(wl_shm::Format::Xbgr8888) => {
            for y in 0..height {
                let row = &src[y * stride..y * stride + width * 4];
                for x in 0..width {
                    let i = x * 4;
                    let o = (y * width + x) * 4;
                    out[o] = row[i];
                    out[o + 1] = row[i + 1];
                    out[o + 2] = row[i + 2];
                    out[o + 3] = 255;
                }
            }
        }
        WEnum::Value(wl_shm::Format::Abgr8888) => {
            for y in 0..height {
                let row = &src[y * stride..y * stride + width * 4];
                let o = y * width * 4;
                out[o..o + width * 4].copy_from_slice(&row[..width * 4]);
            }
        }
        _ => {
            // Unsupported format: reject, the client may retry
            return None;
        }
    }
    Some(out)
}
