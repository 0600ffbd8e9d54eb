//! Host doubles for the hardware boundaries

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::string::{String, ToString};
use std::vec::Vec;

use embedded_hal::delay::DelayNs;

use crate::clock::{Clock, DateTime};
use crate::error::FsError;
use crate::volume::{EntryInfo, MediumController, OpenMode, Volume};

#[derive(Default)]
pub struct MemState {
    pub files: BTreeMap<String, Vec<u8>>,
    pub dirs: BTreeSet<String>,
    pub mounted: bool,
    pub mountable: bool,
    /// Next N opens fail with `FsError::Io`
    pub failing_opens: usize,
    /// Every open fails while set
    pub opens_broken: bool,
    /// Writes accept at most this many bytes
    pub write_limit: Option<usize>,
    pub fail_create_dir: bool,
    pub opens: Vec<String>,
    pub mount_calls: u32,
    pub unmount_calls: u32,
    pub probe_calls: u32,
    pub syncs: u32,
}

/// In-memory volume with fault injection. Clones share state.
#[derive(Clone)]
pub struct MemVolume(pub Rc<RefCell<MemState>>);

pub struct MemFile {
    path: String,
    pos: usize,
    writable: bool,
}

impl MemVolume {
    pub fn new() -> Self {
        MemVolume(Rc::new(RefCell::new(MemState {
            mountable: true,
            ..MemState::default()
        })))
    }

    pub fn mounted() -> Self {
        let v = Self::new();
        v.0.borrow_mut().mounted = true;
        v
    }

    pub fn state(&self) -> std::cell::RefMut<'_, MemState> {
        self.0.borrow_mut()
    }

    pub fn put(&self, path: &str, data: &[u8]) {
        self.state().files.insert(path.to_string(), data.to_vec());
    }

    pub fn contents(&self, path: &str) -> Option<String> {
        self.0
            .borrow()
            .files
            .get(path)
            .map(|d| String::from_utf8_lossy(d).into_owned())
    }

    pub fn files_in(&self, dir: &str) -> Vec<String> {
        let prefix = std::format!("{}/", dir);
        self.0
            .borrow()
            .files
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect()
    }

    fn check_mounted(&self) -> Result<(), FsError> {
        if self.0.borrow().mounted {
            Ok(())
        } else {
            Err(FsError::NotMounted)
        }
    }
}

impl Volume for MemVolume {
    type File = MemFile;

    fn probe(&mut self) -> Result<(), FsError> {
        self.state().probe_calls += 1;
        self.check_mounted()
    }

    fn mount(&mut self) -> Result<(), FsError> {
        let mut s = self.state();
        s.mount_calls += 1;
        if s.mountable {
            s.mounted = true;
            Ok(())
        } else {
            Err(FsError::Io)
        }
    }

    fn unmount(&mut self) {
        let mut s = self.state();
        s.unmount_calls += 1;
        s.mounted = false;
    }

    fn create_dir(&mut self, path: &str) -> Result<(), FsError> {
        self.check_mounted()?;
        let mut s = self.state();
        if s.fail_create_dir {
            return Err(FsError::Io);
        }
        if !s.dirs.insert(path.to_string()) {
            return Err(FsError::AlreadyExists);
        }
        Ok(())
    }

    fn stat(&mut self, path: &str) -> Result<u32, FsError> {
        self.check_mounted()?;
        self.0
            .borrow()
            .files
            .get(path)
            .map(|d| d.len() as u32)
            .ok_or(FsError::NotFound)
    }

    fn list_root(&mut self, visit: &mut dyn FnMut(&EntryInfo)) -> Result<(), FsError> {
        self.check_mounted()?;
        let s = self.0.borrow();
        for dir in &s.dirs {
            let mut name = heapless::String::new();
            let _ = name.push_str(dir);
            visit(&EntryInfo { name, is_dir: true, size: 0 });
        }
        for (path, data) in s.files.iter().filter(|(p, _)| !p.contains('/')) {
            let mut name = heapless::String::new();
            let _ = name.push_str(path);
            visit(&EntryInfo { name, is_dir: false, size: data.len() as u32 });
        }
        Ok(())
    }

    fn open(&mut self, path: &str, mode: OpenMode) -> Result<MemFile, FsError> {
        self.check_mounted()?;
        let mut s = self.state();
        s.opens.push(path.to_string());
        if s.opens_broken {
            return Err(FsError::Io);
        }
        if s.failing_opens > 0 {
            s.failing_opens -= 1;
            return Err(FsError::Io);
        }
        match mode {
            OpenMode::Read => {
                if !s.files.contains_key(path) {
                    return Err(FsError::NotFound);
                }
            }
            OpenMode::WriteCreate => {
                s.files.entry(path.to_string()).or_default();
            }
            OpenMode::WriteTruncate => {
                s.files.insert(path.to_string(), Vec::new());
            }
        }
        Ok(MemFile {
            path: path.to_string(),
            pos: 0,
            writable: mode != OpenMode::Read,
        })
    }

    fn seek_end(&mut self, file: &mut MemFile) -> Result<u32, FsError> {
        let len = self.0.borrow().files.get(&file.path).map_or(0, Vec::len);
        file.pos = len;
        Ok(len as u32)
    }

    fn read(&mut self, file: &mut MemFile, buf: &mut [u8]) -> Result<usize, FsError> {
        let s = self.0.borrow();
        let data = s.files.get(&file.path).ok_or(FsError::NotFound)?;
        let n = buf.len().min(data.len().saturating_sub(file.pos));
        buf[..n].copy_from_slice(&data[file.pos..file.pos + n]);
        file.pos += n;
        Ok(n)
    }

    fn write(&mut self, file: &mut MemFile, data: &[u8]) -> Result<usize, FsError> {
        if !file.writable {
            return Err(FsError::Io);
        }
        let mut s = self.state();
        let n = s.write_limit.map_or(data.len(), |l| l.min(data.len()));
        let content = s.files.entry(file.path.clone()).or_default();
        let end = file.pos + n;
        if content.len() < end {
            content.resize(end, 0);
        }
        content[file.pos..end].copy_from_slice(&data[..n]);
        file.pos = end;
        Ok(n)
    }

    fn sync(&mut self, _file: &mut MemFile) -> Result<(), FsError> {
        self.state().syncs += 1;
        Ok(())
    }

    fn close(&mut self, _file: MemFile) -> Result<(), FsError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct CtrlState {
    pub ready: bool,
    /// `init_card` keeps failing while set
    pub card_dead: bool,
    /// Fail this many `init_card` calls, then succeed
    pub card_failures: u32,
    pub deinit_calls: u32,
    pub configure_calls: u32,
    pub init_calls: u32,
}

/// Call-counting storage controller. Clones share state.
#[derive(Clone)]
pub struct MockController(pub Rc<RefCell<CtrlState>>);

impl MockController {
    pub fn new() -> Self {
        MockController(Rc::new(RefCell::new(CtrlState {
            ready: true,
            ..CtrlState::default()
        })))
    }

    pub fn state(&self) -> std::cell::RefMut<'_, CtrlState> {
        self.0.borrow_mut()
    }

    /// Total hardware-affecting calls so far
    pub fn hw_calls(&self) -> u32 {
        let s = self.0.borrow();
        s.deinit_calls + s.configure_calls + s.init_calls
    }
}

impl MediumController for MockController {
    fn is_ready(&mut self) -> bool {
        self.0.borrow().ready
    }

    fn capacity(&mut self) -> Option<(u32, u32)> {
        if self.0.borrow().ready {
            Some((512, 7_744_512))
        } else {
            None
        }
    }

    fn deinit(&mut self) {
        self.state().deinit_calls += 1;
    }

    fn configure(&mut self) {
        self.state().configure_calls += 1;
    }

    fn init_card(&mut self) -> Result<(), FsError> {
        let mut s = self.state();
        s.init_calls += 1;
        if s.card_dead {
            return Err(FsError::Io);
        }
        if s.card_failures > 0 {
            s.card_failures -= 1;
            return Err(FsError::Io);
        }
        Ok(())
    }
}

/// Manually driven clock. Clones share the same time.
#[derive(Clone)]
pub struct ManualClock {
    ms: Rc<Cell<u32>>,
    unix: Rc<Cell<u32>>,
}

impl ManualClock {
    pub fn new(start: DateTime) -> Self {
        ManualClock {
            ms: Rc::new(Cell::new(0)),
            unix: Rc::new(Cell::new(start.to_unix())),
        }
    }

    pub fn set_ms(&self, ms: u32) {
        self.ms.set(ms);
    }

    pub fn advance_ms(&self, ms: u32) {
        self.ms.set(self.ms.get().wrapping_add(ms));
    }

    pub fn advance_secs(&self, secs: u32) {
        self.unix.set(self.unix.get() + secs);
        self.advance_ms(secs * 1000);
    }

    pub fn delay(&self) -> ManualDelay {
        ManualDelay {
            clock: self.clone(),
            total_ms: Rc::new(Cell::new(0)),
            sub_ms_ns: 0,
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime {
        DateTime::from_unix(self.unix.get())
    }

    fn monotonic_ms(&self) -> u32 {
        self.ms.get()
    }
}

/// Delay that advances the monotonic tick of its [`ManualClock`].
#[derive(Clone)]
pub struct ManualDelay {
    clock: ManualClock,
    pub total_ms: Rc<Cell<u32>>,
    sub_ms_ns: u32,
}

impl DelayNs for ManualDelay {
    fn delay_ns(&mut self, ns: u32) {
        let total = u64::from(self.sub_ms_ns) + u64::from(ns);
        self.sub_ms_ns = (total % 1_000_000) as u32;
        let ms = (total / 1_000_000) as u32;
        if ms > 0 {
            self.delay_ms(ms);
        }
    }

    fn delay_ms(&mut self, ms: u32) {
        self.total_ms.set(self.total_ms.get() + ms);
        self.clock.advance_ms(ms);
    }
}

pub fn start_time() -> DateTime {
    DateTime::new(2025, 1, 1, 12, 0, 0)
}
