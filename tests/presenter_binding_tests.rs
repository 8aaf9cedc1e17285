// Buffer binding seen from the host side
//
// The presenter's own unit tests pin down conversion and memoization; these
// tests drive binding together with the view arena the way the server loop
// and an embedding renderer do: buffers die mid-hold, image handles are
// cloned out and kept across rebinds, and release ordering is observed over
// a whole frame sequence.

use std::sync::Arc;

use memmap2::MmapOptions;
use wayland_server::protocol::wl_shm;
use wayland_server::WEnum;

use alcove::presenter::{bind_buffer, BufferRecord, BufferSource, DmabufPlane};
use alcove::view::{ImageHandle, ViewManager};

fn shm_record(id: u32, width: i32, height: i32, fill: &[u8]) -> BufferRecord {
    let stride = width * 4;
    let len = (stride * height) as usize;
    let mut map = MmapOptions::new().len(len).map_anon().unwrap();
    for (dst, src) in map.iter_mut().zip(fill.iter().cycle()) {
        *dst = *src;
    }
    BufferRecord {
        id,
        width,
        height,
        source: BufferSource::Shm {
            map: Arc::new(map.make_read_only().unwrap()),
            stride,
            offset: 0,
            format: WEnum::Value(wl_shm::Format::Abgr8888),
        },
    }
}

fn null_fd() -> std::os::fd::OwnedFd {
    std::fs::File::open("/dev/null").unwrap().into()
}

fn gpu_record(id: u32, width: i32, height: i32) -> BufferRecord {
    BufferRecord {
        id,
        width,
        height,
        source: BufferSource::Dmabuf {
            planes: vec![DmabufPlane {
                fd: null_fd(),
                offset: 0,
                stride: (width * 4) as u32,
            }],
            fourcc: 0x3432_5241, // AR24
            modifier: 0,
        },
    }
}

fn nv12_record(id: u32, width: i32, height: i32) -> BufferRecord {
    BufferRecord {
        id,
        width,
        height,
        source: BufferSource::Dmabuf {
            planes: vec![
                DmabufPlane {
                    fd: null_fd(),
                    offset: 0,
                    stride: width as u32,
                },
                DmabufPlane {
                    fd: null_fd(),
                    offset: (width * height) as u32,
                    stride: width as u32,
                },
            ],
            fourcc: 0x3231_564E, // NV12
            modifier: 0,
        },
    }
}

#[test]
fn test_release_order_over_a_frame_sequence() {
    let mut views = ViewManager::new();
    let view = views.ensure_view(100);

    // Frame 1: shm buffer is copied out and released at once.
    let f1 = bind_buffer(&mut views, view, Some(&shm_record(1, 64, 64, &[0]))).unwrap();
    assert_eq!(f1.release, vec![1]);

    // Frame 2: first GPU buffer; nothing held yet, nothing to release.
    let f2 = bind_buffer(&mut views, view, Some(&gpu_record(2, 64, 64))).unwrap();
    assert!(f2.rebuilt);
    assert!(f2.release.is_empty());

    // Frame 3: GPU swap releases the previously held buffer.
    let f3 = bind_buffer(&mut views, view, Some(&gpu_record(3, 64, 64))).unwrap();
    assert_eq!(f3.release, vec![2]);

    // Frame 4: back to shm; the held GPU buffer goes out before the copy.
    let f4 = bind_buffer(&mut views, view, Some(&shm_record(4, 64, 64, &[0]))).unwrap();
    assert_eq!(f4.release, vec![3, 4]);
    assert_eq!(views.view(view).unwrap().last_gpu_buffer(), None);
}

#[test]
fn test_destroyed_buffer_is_forgotten_not_released() {
    let mut views = ViewManager::new();
    let view = views.ensure_view(100);

    bind_buffer(&mut views, view, Some(&gpu_record(7, 64, 64))).unwrap();
    assert_eq!(views.view(view).unwrap().last_gpu_buffer(), Some(7));

    // Client destroys the wl_buffer while it is the current image. The
    // memoized identity must go away so no release is ever sent for it.
    views.buffer_destroyed(7);
    assert_eq!(views.view(view).unwrap().last_gpu_buffer(), None);

    let next = bind_buffer(&mut views, view, Some(&gpu_record(8, 64, 64))).unwrap();
    assert!(next.rebuilt);
    assert!(next.release.is_empty());
}

#[test]
fn test_destroyed_buffer_leaves_other_views_alone() {
    let mut views = ViewManager::new();
    let a = views.ensure_view(100);
    let b = views.ensure_view(200);

    bind_buffer(&mut views, a, Some(&gpu_record(7, 64, 64))).unwrap();
    bind_buffer(&mut views, b, Some(&gpu_record(8, 64, 64))).unwrap();

    views.buffer_destroyed(7);
    assert_eq!(views.view(a).unwrap().last_gpu_buffer(), None);
    assert_eq!(views.view(b).unwrap().last_gpu_buffer(), Some(8));

    // The untouched view still releases its held buffer on the next swap.
    let swap = bind_buffer(&mut views, b, Some(&gpu_record(9, 64, 64))).unwrap();
    assert_eq!(swap.release, vec![8]);
}

#[test]
fn test_cloned_image_is_a_stable_snapshot() {
    let mut views = ViewManager::new();
    let view = views.ensure_view(100);

    bind_buffer(&mut views, view, Some(&shm_record(1, 2, 2, &[0x11]))).unwrap();
    // The host clones the handle out, exactly what the compositor accessor
    // does, and may keep drawing from it across later commits.
    let snapshot = views.view(view).unwrap().image().unwrap().clone();

    bind_buffer(&mut views, view, Some(&shm_record(2, 2, 2, &[0xEE]))).unwrap();

    match snapshot {
        ImageHandle::Shm { pixels, .. } => assert!(pixels.iter().all(|b| *b == 0x11)),
        other => panic!("expected an shm snapshot, got {:?}", other),
    }
    match views.view(view).unwrap().image().unwrap() {
        ImageHandle::Shm { pixels, .. } => assert!(pixels.iter().all(|b| *b == 0xEE)),
        other => panic!("expected an shm image, got {:?}", other),
    }
}

#[test]
fn test_gpu_image_carries_planes_through() {
    let mut views = ViewManager::new();
    let view = views.ensure_view(100);

    bind_buffer(&mut views, view, Some(&nv12_record(5, 640, 480))).unwrap();

    let image = views.view(view).unwrap().image().unwrap();
    assert!(image.is_gpu());
    assert_eq!(image.size(), (640, 480));
    match image {
        ImageHandle::Gpu {
            planes,
            fourcc,
            modifier,
            ..
        } => {
            assert_eq!(planes.len(), 2);
            assert_eq!(*fourcc, 0x3231_564E);
            assert_eq!(*modifier, 0);
            assert_eq!(planes[1].offset, 640 * 480);
        }
        other => panic!("expected a gpu image, got {:?}", other),
    }
}

#[test]
fn test_fresh_view_has_no_extent_until_first_bind() {
    let mut views = ViewManager::new();
    let view = views.ensure_view(100);
    assert_eq!(views.view(view).unwrap().size(), (0, 0));
    assert!(views.view(view).unwrap().image().is_none());

    bind_buffer(&mut views, view, Some(&shm_record(1, 320, 240, &[0]))).unwrap();
    assert_eq!(views.view(view).unwrap().size(), (320, 240));
    assert_eq!(views.view_by_surface(100).unwrap().id, view);
}
