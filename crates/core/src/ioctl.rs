//! `FsControl` over the kernel ioctl interface
//!
//! Control calls go to a directory handle on the mount point. Segment bytes
//! are read straight from the block device, memory-mapped when enabled.

use crate::control::{
    BlockDesc, CheckpointInfo, CheckpointStat, CleanRequest, CpMode, FsControl, Period,
    SegmentBuf, SegmentUsage, UsageStat, VirtualBlockDesc, VirtualBlockInfo,
};
use crate::error::ControlError;
use crate::layout::{Geometry, Superblock, SB_OFFSET_BYTES, SB_READ_BYTES};
use memmap2::MmapOptions;
use std::fs::File;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RawArgv {
    base: u64,
    nmembs: u32,
    size: u16,
    flags: u16,
    index: u64,
}

impl RawArgv {
    /// Input array the kernel only reads
    fn for_slice<T>(items: &[T], index: u64, flags: u16) -> Self {
        Self {
            base: items.as_ptr() as u64,
            nmembs: items.len() as u32,
            size: std::mem::size_of::<T>() as u16,
            flags,
            index,
        }
    }

    /// Array the kernel fills in
    fn for_buffer<T>(items: &mut [T], index: u64, flags: u16) -> Self {
        Self {
            base: items.as_mut_ptr() as u64,
            ..Self::for_slice(items, index, flags)
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawSuinfo {
    lastmod: u64,
    nblocks: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSustat {
    nsegs: u64,
    ncleansegs: u64,
    ndirtysegs: u64,
    ctime: u64,
    nongc_ctime: u64,
    prot_seq: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawCpinfo {
    flags: u32,
    pad: u32,
    cno: u64,
    create: u64,
    nblk_inc: u64,
    inodes_count: u64,
    blocks_count: u64,
    next: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCpstat {
    cno: u64,
    ncps: u64,
    nsss: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawVinfo {
    vblocknr: u64,
    start: u64,
    end: u64,
    blocknr: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawVdesc {
    ino: u64,
    cno: u64,
    vblocknr: u64,
    period_start: u64,
    period_end: u64,
    blocknr: u64,
    offset: u64,
    flags: u32,
    pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawBdesc {
    ino: u64,
    oblocknr: u64,
    blocknr: u64,
    offset: u64,
    level: u32,
    pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawSuinfoUpdate {
    segnum: u64,
    flags: u32,
    reserved: u32,
    suinfo: RawSuinfo,
}

const SUINFO_UPDATE_LASTMOD: u32 = 1 << 0;

const IOC_MAGIC: u8 = b'n';
const FS_IOC_MAGIC: u8 = b'X';

mod sys {
    use super::{RawArgv, RawCpstat, RawSustat, FS_IOC_MAGIC, IOC_MAGIC};

    nix::ioctl_read!(get_cpinfo, IOC_MAGIC, 0x82, RawArgv);
    nix::ioctl_read!(get_cpstat, IOC_MAGIC, 0x83, RawCpstat);
    nix::ioctl_read!(get_suinfo, IOC_MAGIC, 0x84, RawArgv);
    nix::ioctl_read!(get_sustat, IOC_MAGIC, 0x85, RawSustat);
    nix::ioctl_readwrite!(get_vinfo, IOC_MAGIC, 0x86, RawArgv);
    nix::ioctl_readwrite!(get_bdescs, IOC_MAGIC, 0x87, RawArgv);
    nix::ioctl_write_ptr!(clean_segments, IOC_MAGIC, 0x88, [RawArgv; 5]);
    nix::ioctl_read!(sync, IOC_MAGIC, 0x8A, u64);
    nix::ioctl_write_ptr!(resize, IOC_MAGIC, 0x8B, u64);
    nix::ioctl_write_ptr!(set_alloc_range, IOC_MAGIC, 0x8C, [u64; 2]);
    nix::ioctl_write_ptr!(set_suinfo, IOC_MAGIC, 0x8D, RawArgv);
    nix::ioctl_readwrite!(freeze, FS_IOC_MAGIC, 119, i32);
    nix::ioctl_readwrite!(thaw, FS_IOC_MAGIC, 120, i32);
}

/// How to open a device
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Map segments instead of copying them into memory
    pub use_mmap: bool,
    /// Directory holding the per-filesystem cleaner lock
    pub runtime_dir: PathBuf,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            use_mmap: true,
            runtime_dir: PathBuf::from("/run/lfsgc"),
        }
    }
}

/// A mounted filesystem reached through its block device and mount point
pub struct DeviceFs {
    device: File,
    mount: File,
    geometry: Geometry,
    use_mmap: bool,
    lock_path: PathBuf,
}

impl DeviceFs {
    /// Open `device` mounted at `mount_dir` and load its geometry
    pub fn open(device: &Path, mount_dir: &Path, options: &OpenOptions) -> Result<Self, ControlError> {
        let device_file = File::open(device)?;
        let mount = File::open(mount_dir)?;

        let mut sb = vec![0u8; SB_READ_BYTES];
        device_file.read_exact_at(&mut sb, SB_OFFSET_BYTES)?;
        let geometry = Superblock::parse(&sb)?.geometry();

        let rdev = device_file.metadata()?.rdev();
        let lock_path = options.runtime_dir.join(format!("cleaner-{rdev:x}.lock"));

        tracing::debug!(
            device = %device.display(),
            block_size = geometry.block_size,
            nsegments = geometry.nsegments,
            "opened filesystem"
        );

        Ok(Self {
            device: device_file,
            mount,
            geometry,
            use_mmap: options.use_mmap,
            lock_path,
        })
    }

    fn fd(&self) -> i32 {
        self.mount.as_raw_fd()
    }
}

impl FsControl for DeviceFs {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn read_segment(&self, segnum: u64) -> Result<SegmentBuf, ControlError> {
        if !self.geometry.contains_segment(segnum) {
            return Err(ControlError::NotFound);
        }
        let bs = u64::from(self.geometry.block_size);
        let offset = self.geometry.segment_start(segnum) * bs;
        let len = self.geometry.segment_blocks(segnum) as usize * bs as usize;

        if self.use_mmap {
            // SAFETY: the mapping is read-only and the kernel only rewrites
            // a segment after the cleaner has released it.
            let map = unsafe { MmapOptions::new().offset(offset).len(len).map(&self.device)? };
            Ok(SegmentBuf::Mapped(map))
        } else {
            let mut buf = vec![0u8; len];
            self.device.read_exact_at(&mut buf, offset)?;
            Ok(SegmentBuf::Owned(buf))
        }
    }

    fn segment_usage(&self, start: u64, max: usize) -> Result<Vec<SegmentUsage>, ControlError> {
        let mut raw = vec![RawSuinfo::default(); max];
        let mut argv = RawArgv::for_buffer(&mut raw, start, 0);
        // SAFETY: argv points at `raw`, which outlives the call.
        unsafe { sys::get_suinfo(self.fd(), &mut argv) }?;
        raw.truncate(argv.nmembs as usize);
        Ok(raw
            .iter()
            .zip(start..)
            .map(|(si, segnum)| SegmentUsage {
                segnum,
                lastmod: si.lastmod,
                nblocks: si.nblocks,
                flags: si.flags,
            })
            .collect())
    }

    fn usage_stat(&self) -> Result<UsageStat, ControlError> {
        let mut raw = RawSustat::default();
        // SAFETY: plain output struct.
        unsafe { sys::get_sustat(self.fd(), &mut raw) }?;
        Ok(UsageStat {
            nsegs: raw.nsegs,
            ncleansegs: raw.ncleansegs,
            ndirtysegs: raw.ndirtysegs,
            ctime: raw.ctime,
            nongc_ctime: raw.nongc_ctime,
            prot_seq: raw.prot_seq,
        })
    }

    fn set_segment_lastmod(&self, segnums: &[u64], lastmod: u64) -> Result<(), ControlError> {
        let updates: Vec<RawSuinfoUpdate> = segnums
            .iter()
            .map(|&segnum| RawSuinfoUpdate {
                segnum,
                flags: SUINFO_UPDATE_LASTMOD,
                suinfo: RawSuinfo {
                    lastmod,
                    ..Default::default()
                },
                ..Default::default()
            })
            .collect();
        let argv = RawArgv::for_slice(&updates, 0, 0);
        // SAFETY: argv points at `updates`, which outlives the call.
        unsafe { sys::set_suinfo(self.fd(), &argv) }?;
        Ok(())
    }

    fn checkpoint_info(
        &self,
        start: u64,
        mode: CpMode,
        max: usize,
    ) -> Result<Vec<CheckpointInfo>, ControlError> {
        let flags = match mode {
            CpMode::Checkpoint => 0,
            CpMode::Snapshot => 1,
        };
        let mut raw = vec![RawCpinfo::default(); max];
        let mut argv = RawArgv::for_buffer(&mut raw, start, flags);
        // SAFETY: argv points at `raw`, which outlives the call.
        unsafe { sys::get_cpinfo(self.fd(), &mut argv) }?;
        raw.truncate(argv.nmembs as usize);
        Ok(raw
            .iter()
            .map(|ci| CheckpointInfo {
                flags: ci.flags,
                cno: ci.cno,
                create: ci.create,
                nblk_inc: ci.nblk_inc,
                inodes_count: ci.inodes_count,
                blocks_count: ci.blocks_count,
                next: ci.next,
            })
            .collect())
    }

    fn checkpoint_stat(&self) -> Result<CheckpointStat, ControlError> {
        let mut raw = RawCpstat::default();
        // SAFETY: plain output struct.
        unsafe { sys::get_cpstat(self.fd(), &mut raw) }?;
        Ok(CheckpointStat {
            cno: raw.cno,
            ncps: raw.ncps,
            nsss: raw.nsss,
        })
    }

    fn virtual_block_info(&self, vblocknrs: &[u64]) -> Result<Vec<VirtualBlockInfo>, ControlError> {
        let mut raw: Vec<RawVinfo> = vblocknrs
            .iter()
            .map(|&vblocknr| RawVinfo {
                vblocknr,
                ..Default::default()
            })
            .collect();
        let mut argv = RawArgv::for_buffer(&mut raw, 0, 0);
        // SAFETY: argv points at `raw`, which outlives the call.
        unsafe { sys::get_vinfo(self.fd(), &mut argv) }?;
        raw.truncate(argv.nmembs as usize);
        Ok(raw
            .iter()
            .map(|vi| VirtualBlockInfo {
                vblocknr: vi.vblocknr,
                start: vi.start,
                end: vi.end,
                blocknr: vi.blocknr,
            })
            .collect())
    }

    fn block_descriptors(&self, bdescs: &mut [BlockDesc]) -> Result<(), ControlError> {
        let mut raw: Vec<RawBdesc> = bdescs.iter().map(raw_bdesc).collect();
        let mut argv = RawArgv::for_buffer(&mut raw, 0, 0);
        // SAFETY: argv points at `raw`, which outlives the call.
        unsafe { sys::get_bdescs(self.fd(), &mut argv) }?;
        for (bdesc, filled) in bdescs.iter_mut().zip(&raw) {
            bdesc.blocknr = filled.blocknr;
        }
        Ok(())
    }

    fn clean_segments(&self, request: &CleanRequest) -> Result<(), ControlError> {
        let vdescs: Vec<RawVdesc> = request.vdescs.iter().map(raw_vdesc).collect();
        let periods: Vec<Period> = request.periods.clone();
        let bdescs: Vec<RawBdesc> = request.bdescs.iter().map(raw_bdesc).collect();
        let argv = [
            RawArgv::for_slice(&vdescs, 0, 0),
            RawArgv::for_slice(&periods, 0, 0),
            RawArgv::for_slice(&request.vblocknrs, 0, 0),
            RawArgv::for_slice(&bdescs, 0, 0),
            RawArgv::for_slice(&request.segnums, 0, 0),
        ];
        // SAFETY: every argv points at a vector that outlives the call.
        unsafe { sys::clean_segments(self.fd(), &argv) }?;
        Ok(())
    }

    fn sync(&self) -> Result<u64, ControlError> {
        let mut cno = 0u64;
        // SAFETY: plain output integer.
        unsafe { sys::sync(self.fd(), &mut cno) }?;
        Ok(cno)
    }

    fn resize(&self, size: u64) -> Result<(), ControlError> {
        // SAFETY: plain input integer.
        unsafe { sys::resize(self.fd(), &size) }?;
        Ok(())
    }

    fn set_alloc_range(&self, start: u64, end: u64) -> Result<(), ControlError> {
        let range = [start, end];
        // SAFETY: plain input array.
        unsafe { sys::set_alloc_range(self.fd(), &range) }?;
        Ok(())
    }

    fn freeze(&self) -> Result<(), ControlError> {
        let mut arg = 0i32;
        // SAFETY: the argument is ignored by the kernel.
        unsafe { sys::freeze(self.fd(), &mut arg) }?;
        Ok(())
    }

    fn thaw(&self) -> Result<(), ControlError> {
        let mut arg = 0i32;
        // SAFETY: the argument is ignored by the kernel.
        unsafe { sys::thaw(self.fd(), &mut arg) }?;
        Ok(())
    }

    fn cleaner_lock_path(&self) -> PathBuf {
        self.lock_path.clone()
    }
}

fn raw_vdesc(vdesc: &VirtualBlockDesc) -> RawVdesc {
    RawVdesc {
        ino: vdesc.ino,
        cno: vdesc.cno,
        vblocknr: vdesc.vblocknr,
        period_start: vdesc.period.start,
        period_end: vdesc.period.end,
        blocknr: vdesc.blocknr,
        offset: vdesc.offset,
        flags: vdesc.flags,
        pad: 0,
    }
}

fn raw_bdesc(bdesc: &BlockDesc) -> RawBdesc {
    RawBdesc {
        ino: bdesc.ino,
        oblocknr: bdesc.oblocknr,
        blocknr: bdesc.blocknr,
        offset: bdesc.offset,
        level: bdesc.level,
        pad: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_kernel_struct_sizes() {
        assert_eq!(size_of::<RawArgv>(), 24);
        assert_eq!(size_of::<RawSuinfo>(), 16);
        assert_eq!(size_of::<RawSustat>(), 48);
        assert_eq!(size_of::<RawCpinfo>(), 56);
        assert_eq!(size_of::<RawCpstat>(), 24);
        assert_eq!(size_of::<RawVinfo>(), 32);
        assert_eq!(size_of::<RawVdesc>(), 64);
        assert_eq!(size_of::<RawBdesc>(), 40);
        assert_eq!(size_of::<RawSuinfoUpdate>(), 32);
        assert_eq!(size_of::<Period>(), 16);
    }

    #[test]
    fn test_open_rejects_non_filesystem() {
        let dir = tempfile::TempDir::new().unwrap();
        let image = dir.path().join("blank.img");
        std::fs::write(&image, vec![0u8; 8192]).unwrap();
        let err = DeviceFs::open(&image, dir.path(), &OpenOptions::default());
        assert!(matches!(err, Err(ControlError::InvalidArgument(_))));
    }
}
