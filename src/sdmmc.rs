//! [`Volume`] and [`MediumController`] over `embedded-sdmmc`
//!
//! The card sits behind a `&'static SdCard` shared by the FAT layer
//! ([`SharedCard`]) and the bring-up side ([`SdCardController`]).
//! embedded-sdmmc only creates 8.3 names, so every path component goes
//! through [`short_name`] on the way down.

use core::fmt::{Debug, Write};

use embedded_hal::delay::DelayNs;
use embedded_hal::spi::SpiDevice;
use embedded_sdmmc::{
    Block, BlockCount, BlockDevice, BlockIdx, Error, Mode, RawDirectory, RawFile, RawVolume,
    SdCard, SdCardError, TimeSource, Timestamp, VolumeIdx, VolumeManager,
};

use crate::clock::Clock;
use crate::config::{SD_SPI_INIT_FREQ, SD_SPI_WORK_FREQ};
use crate::error::FsError;
use crate::volume::{short_name, EntryInfo, MediumController, OpenMode, Volume};

/// Bytes per SD block
const BLOCK_SIZE: u32 = 512;

fn fs_error<E: Debug>(e: Error<E>) -> FsError {
    match e {
        Error::NotFound => FsError::NotFound,
        Error::DirAlreadyExists | Error::FileAlreadyExists => FsError::AlreadyExists,
        Error::FilenameError(_) => FsError::InvalidName,
        Error::TooManyOpenVolumes | Error::TooManyOpenDirs | Error::TooManyOpenFiles => {
            FsError::TooManyOpen
        }
        Error::NotEnoughSpace | Error::DiskFull => FsError::DiskFull,
        _ => FsError::Io,
    }
}

/// Stamps FAT directory entries with the board clock.
#[derive(Clone)]
pub struct ClockTimeSource<K>(pub K);

impl<K: Clock> TimeSource for ClockTimeSource<K> {
    fn get_timestamp(&self) -> Timestamp {
        let now = self.0.now();
        Timestamp::from_calendar(now.year, now.month, now.day, now.hour, now.minute, now.second)
            // 2025-01-01 00:00:00
            .unwrap_or(Timestamp::from_fat(0x5A21, 0))
    }
}

/// Block device view of a card that is also driven by [`SdCardController`].
pub struct SharedCard<S: SpiDevice<u8> + 'static, D: DelayNs + 'static>(pub &'static SdCard<S, D>);

impl<S: SpiDevice<u8> + 'static, D: DelayNs + 'static> Clone for SharedCard<S, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: SpiDevice<u8> + 'static, D: DelayNs + 'static> Copy for SharedCard<S, D> {}

impl<S: SpiDevice<u8> + 'static, D: DelayNs + 'static> BlockDevice for SharedCard<S, D> {
    type Error = SdCardError;

    fn read(&self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        BlockDevice::read(self.0, blocks, start_block_idx)
    }

    fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        BlockDevice::write(self.0, blocks, start_block_idx)
    }

    fn num_blocks(&self) -> Result<BlockCount, Self::Error> {
        BlockDevice::num_blocks(self.0)
    }
}

/// Card bring-up over SPI: clock switching, re-probe, capacity.
pub struct SdCardController<S: SpiDevice<u8> + 'static, D: DelayNs + 'static, F> {
    card: &'static SdCard<S, D>,
    set_frequency: F,
}

impl<S, D, F> SdCardController<S, D, F>
where
    S: SpiDevice<u8> + 'static,
    D: DelayNs + 'static,
    F: FnMut(&mut S, u32),
{
    /// `set_frequency` retunes the SPI bus beneath the device.
    pub fn new(card: &'static SdCard<S, D>, set_frequency: F) -> Self {
        Self { card, set_frequency }
    }

    fn bus_frequency(&mut self, hz: u32) {
        let set = &mut self.set_frequency;
        self.card.spi(|dev| set(dev, hz));
        debug!("SPI switched to {} Hz", hz);
    }
}

impl<S, D, F> MediumController for SdCardController<S, D, F>
where
    S: SpiDevice<u8> + 'static,
    D: DelayNs + 'static,
    F: FnMut(&mut S, u32),
{
    fn is_ready(&mut self) -> bool {
        self.card.num_bytes().is_ok()
    }

    fn capacity(&mut self) -> Option<(u32, u32)> {
        let bytes = self.card.num_bytes().ok()?;
        Some((BLOCK_SIZE, (bytes / u64::from(BLOCK_SIZE)) as u32))
    }

    fn deinit(&mut self) {
        self.card.mark_card_uninit();
    }

    fn configure(&mut self) {
        // SD cards must be initialized at no more than 400 kHz
        self.bus_frequency(SD_SPI_INIT_FREQ);
    }

    fn init_card(&mut self) -> Result<(), FsError> {
        match self.card.num_bytes() {
            Ok(bytes) => {
                info!("SD card: {} MB", bytes / (1024 * 1024));
                self.bus_frequency(SD_SPI_WORK_FREQ);
                Ok(())
            }
            Err(_) => {
                self.card.mark_card_uninit();
                Err(FsError::Io)
            }
        }
    }
}

/// FAT volume 0 of a block device.
///
/// Unmounting drops the whole `VolumeManager`, so handles leaked by a failed
/// operation cannot keep the next mount from opening the volume.
pub struct SdmmcVolume<D, T>
where
    D: BlockDevice + Clone,
    T: TimeSource + Clone,
    D::Error: Debug,
{
    device: D,
    time_source: T,
    mgr: VolumeManager<D, T>,
    open: Option<(RawVolume, RawDirectory)>,
}

impl<D, T> SdmmcVolume<D, T>
where
    D: BlockDevice + Clone,
    T: TimeSource + Clone,
    D::Error: Debug,
{
    pub fn new(device: D, time_source: T) -> Self {
        Self {
            mgr: VolumeManager::new(device.clone(), time_source.clone()),
            device,
            time_source,
            open: None,
        }
    }

    fn root(&self) -> Result<RawDirectory, FsError> {
        self.open.map(|(_, root)| root).ok_or(FsError::NotMounted)
    }

    /// Run `op` on the parent directory of `path` with the 8.3 leaf name.
    fn in_parent<R>(
        &self,
        path: &str,
        op: impl FnOnce(&VolumeManager<D, T>, RawDirectory, &str) -> Result<R, Error<D::Error>>,
    ) -> Result<R, FsError> {
        let root = self.root()?;
        let (parents, leaf) = path.rsplit_once('/').unwrap_or(("", path));

        let mut opened: Option<RawDirectory> = None;
        for component in parents.split('/').filter(|c| !c.is_empty()) {
            let next = self
                .mgr
                .open_dir(opened.unwrap_or(root), short_name(component).as_str());
            if let Some(dir) = opened.take() {
                let _ = self.mgr.close_dir(dir);
            }
            opened = Some(next.map_err(fs_error)?);
        }

        let result = op(&self.mgr, opened.unwrap_or(root), short_name(leaf).as_str());
        if let Some(dir) = opened {
            let _ = self.mgr.close_dir(dir);
        }
        result.map_err(fs_error)
    }
}

impl<D, T> Volume for SdmmcVolume<D, T>
where
    D: BlockDevice + Clone,
    T: TimeSource + Clone,
    D::Error: Debug,
{
    type File = RawFile;

    fn probe(&mut self) -> Result<(), FsError> {
        let root = self.root()?;
        self.mgr.iterate_dir(root, |_| {}).map_err(fs_error)
    }

    fn mount(&mut self) -> Result<(), FsError> {
        self.unmount();
        let volume = self.mgr.open_raw_volume(VolumeIdx(0)).map_err(fs_error)?;
        match self.mgr.open_root_dir(volume) {
            Ok(root) => {
                self.open = Some((volume, root));
                Ok(())
            }
            Err(e) => {
                let _ = self.mgr.close_volume(volume);
                Err(fs_error(e))
            }
        }
    }

    fn unmount(&mut self) {
        if let Some((volume, root)) = self.open.take() {
            let _ = self.mgr.close_dir(root);
            let _ = self.mgr.close_volume(volume);
        }
        self.mgr = VolumeManager::new(self.device.clone(), self.time_source.clone());
    }

    fn create_dir(&mut self, path: &str) -> Result<(), FsError> {
        self.in_parent(path, |mgr, dir, name| mgr.make_dir_in_dir(dir, name))
    }

    fn stat(&mut self, path: &str) -> Result<u32, FsError> {
        self.in_parent(path, |mgr, dir, name| {
            mgr.find_directory_entry(dir, name).map(|entry| entry.size)
        })
    }

    fn list_root(&mut self, visit: &mut dyn FnMut(&EntryInfo)) -> Result<(), FsError> {
        let root = self.root()?;
        self.mgr
            .iterate_dir(root, |entry| {
                if entry.attributes.is_volume() {
                    return;
                }
                let mut name = heapless::String::new();
                let _ = write!(name, "{}", entry.name);
                visit(&EntryInfo {
                    name,
                    is_dir: entry.attributes.is_directory(),
                    size: entry.size,
                });
            })
            .map_err(fs_error)
    }

    fn open(&mut self, path: &str, mode: OpenMode) -> Result<RawFile, FsError> {
        let mode = match mode {
            OpenMode::Read => Mode::ReadOnly,
            OpenMode::WriteCreate => Mode::ReadWriteCreateOrAppend,
            OpenMode::WriteTruncate => Mode::ReadWriteCreateOrTruncate,
        };
        self.in_parent(path, |mgr, dir, name| mgr.open_file_in_dir(dir, name, mode))
    }

    fn seek_end(&mut self, file: &mut RawFile) -> Result<u32, FsError> {
        self.mgr.file_seek_from_end(*file, 0).map_err(fs_error)?;
        self.mgr.file_length(*file).map_err(fs_error)
    }

    fn read(&mut self, file: &mut RawFile, buf: &mut [u8]) -> Result<usize, FsError> {
        match self.mgr.read(*file, buf) {
            Ok(n) => Ok(n),
            Err(Error::EndOfFile) => Ok(0),
            Err(e) => Err(fs_error(e)),
        }
    }

    fn write(&mut self, file: &mut RawFile, data: &[u8]) -> Result<usize, FsError> {
        self.mgr.write(*file, data).map_err(fs_error)?;
        Ok(data.len())
    }

    fn sync(&mut self, file: &mut RawFile) -> Result<(), FsError> {
        self.mgr.flush_file(*file).map_err(fs_error)
    }

    fn close(&mut self, file: RawFile) -> Result<(), FsError> {
        self.mgr.close_file(file).map_err(fs_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{start_time, ManualClock};
    use crate::volume::write_all;
    use core::cell::RefCell;
    use std::rc::Rc;
    use std::vec::Vec;

    const DISK_BLOCKS: u32 = 4268;
    const FAT_BLOCKS: u16 = 17;

    /// RAM disk shared between volumes, like a card that stays inserted.
    #[derive(Clone)]
    struct RamDisk(Rc<RefCell<Vec<[u8; 512]>>>);

    impl BlockDevice for RamDisk {
        type Error = ();

        fn read(&self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), ()> {
            let disk = self.0.borrow();
            for (i, block) in blocks.iter_mut().enumerate() {
                block.contents = *disk.get(start_block_idx.0 as usize + i).ok_or(())?;
            }
            Ok(())
        }

        fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), ()> {
            let mut disk = self.0.borrow_mut();
            for (i, block) in blocks.iter().enumerate() {
                *disk.get_mut(start_block_idx.0 as usize + i).ok_or(())? = block.contents;
            }
            Ok(())
        }

        fn num_blocks(&self) -> Result<BlockCount, ()> {
            Ok(BlockCount(self.0.borrow().len() as u32))
        }
    }

    fn put_u16(block: &mut [u8; 512], at: usize, value: u16) {
        block[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// MBR plus one freshly formatted FAT16 partition: 4200 one-block
    /// clusters, the smallest size that is not FAT12.
    fn fat16_disk() -> RamDisk {
        let mut disk = std::vec![[0u8; 512]; DISK_BLOCKS as usize];
        let part_blocks = DISK_BLOCKS - 1;

        let mbr = &mut disk[0];
        mbr[446 + 4] = 0x06;
        mbr[446 + 8..446 + 12].copy_from_slice(&1u32.to_le_bytes());
        mbr[446 + 12..446 + 16].copy_from_slice(&part_blocks.to_le_bytes());
        mbr[510..].copy_from_slice(&[0x55, 0xAA]);

        let bpb = &mut disk[1];
        bpb[..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
        bpb[3..11].copy_from_slice(b"MSWIN4.1");
        put_u16(bpb, 11, 512);
        bpb[13] = 1;
        put_u16(bpb, 14, 1);
        bpb[16] = 2;
        put_u16(bpb, 17, 512);
        put_u16(bpb, 19, part_blocks as u16);
        bpb[21] = 0xF8;
        put_u16(bpb, 22, FAT_BLOCKS);
        bpb[38] = 0x29;
        bpb[43..54].copy_from_slice(b"LOGGER     ");
        bpb[54..62].copy_from_slice(b"FAT16   ");
        bpb[510..].copy_from_slice(&[0x55, 0xAA]);

        for fat in 0..2 {
            let first = 2 + fat * usize::from(FAT_BLOCKS);
            disk[first][..4].copy_from_slice(&[0xF8, 0xFF, 0xFF, 0xFF]);
        }
        RamDisk(Rc::new(RefCell::new(disk)))
    }

    type RamVolume = SdmmcVolume<RamDisk, ClockTimeSource<ManualClock>>;

    fn volume(disk: &RamDisk) -> RamVolume {
        SdmmcVolume::new(disk.clone(), ClockTimeSource(ManualClock::new(start_time())))
    }

    fn mounted(disk: &RamDisk) -> RamVolume {
        let mut vol = volume(disk);
        vol.mount().unwrap();
        vol
    }

    fn append(vol: &mut RamVolume, path: &str, data: &[u8]) {
        let mut file = vol.open(path, OpenMode::WriteCreate).unwrap();
        vol.seek_end(&mut file).unwrap();
        write_all(vol, &mut file, data).unwrap();
        vol.sync(&mut file).unwrap();
        vol.close(file).unwrap();
    }

    fn read_all(vol: &mut RamVolume, path: &str) -> Vec<u8> {
        let mut file = vol.open(path, OpenMode::Read).unwrap();
        let mut out = Vec::new();
        let mut chunk = [0u8; 5];
        loop {
            let n = vol.read(&mut file, &mut chunk).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        vol.close(file).unwrap();
        out
    }

    #[test]
    fn sdmmc_errors_map_onto_fs_errors() {
        assert_eq!(fs_error::<()>(Error::NotFound), FsError::NotFound);
        assert_eq!(fs_error::<()>(Error::DirAlreadyExists), FsError::AlreadyExists);
        assert_eq!(fs_error::<()>(Error::TooManyOpenFiles), FsError::TooManyOpen);
        assert_eq!(fs_error::<()>(Error::DiskFull), FsError::DiskFull);
        assert_eq!(fs_error(Error::DeviceError(())), FsError::Io);
    }

    #[test]
    fn directory_entries_are_stamped_with_the_board_clock() {
        let ts = ClockTimeSource(ManualClock::new(start_time())).get_timestamp();
        assert_eq!(ts.year_since_1970, 55);
        assert_eq!((ts.zero_indexed_month, ts.zero_indexed_day), (0, 0));
        assert_eq!((ts.hours, ts.minutes, ts.seconds), (12, 0, 0));
    }

    #[test]
    fn unmounted_volume_refuses_work() {
        let disk = fat16_disk();
        let mut vol = volume(&disk);
        assert_eq!(vol.probe(), Err(FsError::NotMounted));
        assert_eq!(vol.create_dir("log"), Err(FsError::NotMounted));
        assert_eq!(vol.open("config.ini", OpenMode::Read).err(), Some(FsError::NotMounted));

        vol.mount().unwrap();
        vol.probe().unwrap();
        vol.unmount();
        assert_eq!(vol.probe(), Err(FsError::NotMounted));
    }

    #[test]
    fn records_append_across_opens_in_a_subdirectory() {
        let disk = fat16_disk();
        let mut vol = mounted(&disk);
        vol.create_dir("log").unwrap();
        assert_eq!(vol.create_dir("log"), Err(FsError::AlreadyExists));

        append(&mut vol, "log/log1.txt", b"first\n");
        let mut file = vol.open("log/log1.txt", OpenMode::WriteCreate).unwrap();
        assert_eq!(vol.seek_end(&mut file).unwrap(), 6);
        write_all(&mut vol, &mut file, b"second\n").unwrap();
        vol.close(file).unwrap();

        assert_eq!(read_all(&mut vol, "log/log1.txt"), b"first\nsecond\n");
        assert_eq!(vol.stat("log/log1.txt"), Ok(13));
        assert_eq!(vol.stat("log/log2.txt"), Err(FsError::NotFound));
    }

    #[test]
    fn read_past_the_end_returns_zero() {
        let disk = fat16_disk();
        let mut vol = mounted(&disk);
        append(&mut vol, "config.ini", b"[Ratio]\n");

        let mut file = vol.open("config.ini", OpenMode::Read).unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(vol.read(&mut file, &mut buf), Ok(8));
        assert_eq!(vol.read(&mut file, &mut buf), Ok(0));
        vol.close(file).unwrap();
        assert_eq!(vol.open("missing.ini", OpenMode::Read).err(), Some(FsError::NotFound));
    }

    #[test]
    fn truncating_open_replaces_content() {
        let disk = fat16_disk();
        let mut vol = mounted(&disk);
        append(&mut vol, "config.ini", b"a much longer old document");
        let mut file = vol.open("config.ini", OpenMode::WriteTruncate).unwrap();
        write_all(&mut vol, &mut file, b"new").unwrap();
        vol.close(file).unwrap();
        assert_eq!(read_all(&mut vol, "config.ini"), b"new");
    }

    #[test]
    fn parent_directories_are_closed_after_each_operation() {
        let disk = fat16_disk();
        let mut vol = mounted(&disk);
        vol.create_dir("sample").unwrap();

        // more operations than the manager has directory handles
        for i in 0..12 {
            let name = std::format!("sample/sampleData202501011200{:02}.txt", i);
            append(&mut vol, &name, b"1.0V\n");
            assert_eq!(vol.stat(&name), Ok(5));
        }
        let mut names = Vec::new();
        vol.list_root(&mut |entry: &EntryInfo| names.push((entry.name.clone(), entry.is_dir)))
            .unwrap();
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].0.as_str(), "SAMPLE");
        assert!(names[0].1);
    }

    #[test]
    fn long_names_are_distinct_on_the_medium() {
        let disk = fat16_disk();
        let mut vol = mounted(&disk);
        append(&mut vol, "boot_count.txt", &[1u8, 0, 0, 0]);
        append(&mut vol, "boot_counter.txt", &[9u8]);
        assert_eq!(read_all(&mut vol, "boot_count.txt"), [1u8, 0, 0, 0]);
        assert_eq!(read_all(&mut vol, "boot_counter.txt"), [9u8]);
    }

    #[test]
    fn remount_sees_persisted_files() {
        let disk = fat16_disk();
        let mut vol = mounted(&disk);
        vol.create_dir("hideData").unwrap();
        append(&mut vol, "boot_count.txt", &2u32.to_le_bytes());

        vol.unmount();
        vol.mount().unwrap();
        assert_eq!(read_all(&mut vol, "boot_count.txt"), 2u32.to_le_bytes());

        let mut other = mounted(&disk);
        let (mut files, mut dirs) = (0, 0);
        other
            .list_root(&mut |entry: &EntryInfo| {
                if entry.is_dir {
                    dirs += 1;
                } else {
                    files += 1;
                    assert_eq!(entry.size, 4);
                }
            })
            .unwrap();
        assert_eq!((files, dirs), (1, 1));
    }
}
