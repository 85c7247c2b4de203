//! File backed shared memory pools for `wl_shm`.

use rustix::{
    io::Errno,
    shm::{Mode, OFlags},
};
use std::{
    fs::File,
    io,
    os::unix::prelude::{AsFd, OwnedFd},
    time::{SystemTime, UNIX_EPOCH},
};

use memmap2::MmapMut;
use wayland_client::{
    protocol::{wl_buffer, wl_shm, wl_shm_pool},
    Connection, Dispatch, QueueHandle, WEnum,
};

use crate::{error::GlobalError, globals::GlobalData, registry::RegistryState};

/// An error that may occur when creating a pool.
#[derive(Debug, thiserror::Error)]
pub enum CreatePoolError {
    /// The wl_shm global is not bound.
    #[error(transparent)]
    Global(#[from] GlobalError),

    /// Error while allocating the shared memory.
    #[error(transparent)]
    Create(#[from] io::Error),
}

pub trait ShmHandler {
    fn shm_state(&mut self) -> &mut ShmState;
}

#[derive(Debug)]
pub struct ShmState {
    wl_shm: wl_shm::WlShm,
    formats: Vec<wl_shm::Format>,
}

impl ShmState {
    pub fn bind<State>(registry: &RegistryState, qh: &QueueHandle<State>) -> Result<ShmState, GlobalError>
    where
        State: Dispatch<wl_shm::WlShm, GlobalData, State> + 'static,
    {
        let wl_shm = registry.bind_one(qh, 1..=1, GlobalData)?;
        Ok(ShmState { wl_shm, formats: Vec::new() })
    }

    pub fn wl_shm(&self) -> &wl_shm::WlShm {
        &self.wl_shm
    }

    /// The formats the compositor accepts in memory pools.
    pub fn formats(&self) -> &[wl_shm::Format] {
        &self.formats[..]
    }
}

impl<D> Dispatch<wl_shm::WlShm, GlobalData, D> for ShmState
where
    D: Dispatch<wl_shm::WlShm, GlobalData> + ShmHandler,
{
    fn event(
        state: &mut D,
        _: &wl_shm::WlShm,
        event: wl_shm::Event,
        _: &GlobalData,
        _: &Connection,
        _: &QueueHandle<D>,
    ) {
        match event {
            wl_shm::Event::Format { format } => match format {
                WEnum::Value(format) => {
                    state.shm_state().formats.push(format);
                    log::debug!(target: "winsys", "supported wl_shm format {:?}", format);
                }
                WEnum::Unknown(raw) => {
                    log::debug!(target: "winsys", "unknown supported wl_shm format {:x}", raw);
                }
            },

            _ => unreachable!(),
        }
    }
}

impl<D> Dispatch<wl_shm_pool::WlShmPool, GlobalData, D> for ShmState
where
    D: Dispatch<wl_shm_pool::WlShmPool, GlobalData>,
{
    fn event(
        _: &mut D,
        _: &wl_shm_pool::WlShmPool,
        _: wl_shm_pool::Event,
        _: &GlobalData,
        _: &Connection,
        _: &QueueHandle<D>,
    ) {
        unreachable!("wl_shm_pool has no events")
    }
}

/// A file backed shared memory pool.
///
/// The pool hands out buffers by offset and does not track their release;
/// users that re-create buffers while older ones may still be attached must
/// keep those alive themselves.
#[derive(Debug)]
pub struct RawPool {
    pool: wl_shm_pool::WlShmPool,
    len: usize,
    mem_file: File,
    mmap: MmapMut,
}

impl RawPool {
    pub fn new<D>(len: usize, shm: &wl_shm::WlShm, qh: &QueueHandle<D>) -> Result<RawPool, CreatePoolError>
    where
        D: Dispatch<wl_shm_pool::WlShmPool, GlobalData> + 'static,
    {
        let shm_fd = RawPool::create_shm_fd()?;
        let mem_file = File::from(shm_fd);
        mem_file.set_len(len as u64)?;

        let pool = shm.create_pool(mem_file.as_fd(), len as i32, qh, GlobalData);
        let mmap = unsafe { MmapMut::map_mut(&mem_file)? };

        Ok(RawPool { pool, len, mem_file, mmap })
    }

    /// The writable mapping of the whole pool.
    pub fn mmap(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Creates a buffer spanning `[offset, offset + height * stride)` of the pool.
    ///
    /// The format must be one the compositor advertised; `argb8888` support is
    /// mandatory for every compositor.
    pub fn create_buffer<D, U>(
        &mut self,
        offset: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: wl_shm::Format,
        udata: U,
        qh: &QueueHandle<D>,
    ) -> wl_buffer::WlBuffer
    where
        D: Dispatch<wl_buffer::WlBuffer, U> + 'static,
        U: Send + Sync + 'static,
    {
        self.pool.create_buffer(offset, width, height, stride, format, qh, udata)
    }

    fn create_shm_fd() -> io::Result<OwnedFd> {
        match RawPool::create_memfd() {
            Ok(fd) => return Ok(fd),

            // Not supported, use the shm_open fallback.
            Err(Errno::NOSYS) => (),

            Err(err) => return Err(err.into()),
        };

        let time = SystemTime::now();
        let mut mem_file_handle =
            format!("/wayland-winsys-{}", time.duration_since(UNIX_EPOCH).unwrap().subsec_nanos());

        loop {
            let flags = OFlags::CREATE | OFlags::EXCL | OFlags::RDWR;
            let mode = Mode::RUSR | Mode::WUSR;

            match rustix::shm::open(mem_file_handle.as_str(), flags, mode) {
                Ok(fd) => match rustix::shm::unlink(mem_file_handle.as_str()) {
                    Ok(_) => return Ok(fd),
                    Err(errno) => return Err(errno.into()),
                },

                Err(Errno::EXIST) => {
                    // Change the handle if we happen to collide.
                    let time = SystemTime::now();
                    mem_file_handle = format!(
                        "/wayland-winsys-{}",
                        time.duration_since(UNIX_EPOCH).unwrap().subsec_nanos()
                    );
                    continue;
                }

                Err(Errno::INTR) => continue,

                Err(err) => return Err(err.into()),
            }
        }
    }

    fn create_memfd() -> rustix::io::Result<OwnedFd> {
        use std::ffi::CStr;

        use rustix::fs::{MemfdFlags, SealFlags};

        loop {
            let name = CStr::from_bytes_with_nul(b"wayland-winsys\0").unwrap();
            let flags = MemfdFlags::ALLOW_SEALING | MemfdFlags::CLOEXEC;

            match rustix::fs::memfd_create(name, flags) {
                Ok(fd) => {
                    let _ = rustix::fs::fcntl_add_seals(&fd, SealFlags::SHRINK | SealFlags::SEAL);
                    return Ok(fd);
                }

                Err(Errno::INTR) => continue,

                Err(err) => return Err(err),
            }
        }
    }
}

impl AsFd for RawPool {
    fn as_fd(&self) -> std::os::unix::prelude::BorrowedFd<'_> {
        self.mem_file.as_fd()
    }
}

impl Drop for RawPool {
    fn drop(&mut self) {
        self.pool.destroy();
    }
}

#[macro_export]
macro_rules! delegate_shm {
    ($ty: ty) => {
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::client::protocol::wl_shm::WlShm: $crate::globals::GlobalData
            ] => $crate::shm::ShmState
        );
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::client::protocol::wl_shm_pool::WlShmPool: $crate::globals::GlobalData
            ] => $crate::shm::ShmState
        );
    };
}
