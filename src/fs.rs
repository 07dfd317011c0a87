//! A small disk-backed file system (C5): a one-block allocation bitmap plus, per file, one info
//! block holding a fixed `direct_blocks[7]` array of data-block numbers. No directories, no
//! filenames. Files are named by an integer id the caller chooses.
//!
//! [`crate::disk::SimpleDisk`] is a pure 512-byte block device, so the `fs_size`/`filesystem`
//! fields a file system layer needs live on [`Disk`] instead, a thin wrapper this module
//! introduces to hold them. `FileSystem`'s file list and each `File`'s place in it are
//! represented as an owned `alloc::vec::Vec<&'static File>` rather than an intrusive linked list,
//! the same as [`crate::memory::VMPool`]'s descriptor list.

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::Mutex;

use crate::disk::SimpleDisk;
use crate::error::NO_BLOCK;

/// Data blocks a file can directly address. No indirect blocks, so this is also the file's block
/// capacity.
pub const DIRECT_BLOCKS: usize = 7;

/// `DIRECT_BLOCKS * 512`.
pub const MAX_FILE_SIZE: u32 = (DIRECT_BLOCKS as u32) * 512;

static_assertions::const_assert_eq!(MAX_FILE_SIZE, 3584);

/// Wraps a [`SimpleDisk`] with the two pieces of bookkeeping the file system layer needs attached
/// to the underlying device rather than to any one `FileSystem` instance: its declared size, and a
/// pointer to whichever `FileSystem` currently considers itself mounted on it. Kept separate from
/// [`crate::disk::BlockingDisk`]/`MirroredDisk`, which never reference either field.
pub struct Disk {
    pub device: &'static dyn SimpleDisk,
    fs_size: Mutex<u32>,
    filesystem: Mutex<Option<&'static FileSystem>>,
}

impl Disk {
    pub fn new(device: &'static dyn SimpleDisk) -> &'static Disk {
        Box::leak(Box::new(Disk {
            device,
            fs_size: Mutex::new(0),
            filesystem: Mutex::new(None),
        }))
    }
}

fn clear_bit(bitmap: &mut [u32], block_no: u32) {
    let idx = (block_no / 32) as usize;
    bitmap[idx] &= !(1 << (block_no % 32));
}

pub struct FileSystem {
    disk: &'static Disk,
    bitmap: Mutex<Vec<u32>>,
    files: Mutex<Vec<&'static File>>,
}

impl FileSystem {
    /// Stamp `disk`'s declared size and tear down whatever file system was last mounted there.
    /// Does not construct a `FileSystem`; `mount` does that, reading the size back. `format` and
    /// `mount` stay two separate calls, the caller runs `format` first and then `mount`.
    pub fn format(disk: &'static Disk, size_bytes: u32) -> bool {
        if let Some(old_fs) = disk.filesystem.lock().take() {
            old_fs.files.lock().clear();
        }
        *disk.fs_size.lock() = size_bytes;
        true
    }

    /// Build a bitmap sized for `disk`'s declared size (one bit per 512-byte block, bit 0 marking
    /// block 0, the bitmap's own home, permanently allocated), and register as `disk`'s mounted
    /// file system. `format` must have run on this disk first.
    pub fn mount(disk: &'static Disk) -> &'static FileSystem {
        let size_bytes = *disk.fs_size.lock();
        // One bit per 512-byte block, 32 bits per bitmap word.
        let n_words = ((size_bytes as u64 * 2 / 1024 / 32).max(1)) as usize;
        let mut bitmap = alloc::vec![0u32; n_words];
        bitmap[0] = 1;

        let fs = Box::leak(Box::new(FileSystem {
            disk,
            bitmap: Mutex::new(bitmap),
            files: Mutex::new(Vec::new()),
        }));
        *disk.filesystem.lock() = Some(fs);
        fs
    }

    pub fn lookup_file(&self, file_id: u32) -> Option<&'static File> {
        self.files.lock().iter().find(|f| f.file_id == file_id).copied()
    }

    /// Fails if `file_id` is already in use, or the disk has no free block for the new info block.
    pub fn create_file(&self, file_id: u32) -> bool {
        if self.lookup_file(file_id).is_some() {
            return false;
        }
        let info_block = self.free_block();
        if info_block == NO_BLOCK {
            return false;
        }
        let file = File::new(file_id, info_block, self);
        self.files.lock().push(file);
        true
    }

    /// Frees the file's data blocks and its info block, then drops it from the file list. The info
    /// block's bit is cleared without a following disk flush; the next `free_block()` call
    /// incidentally persists it.
    pub fn delete_file(&self, file_id: u32) -> bool {
        let removed = {
            let mut files = self.files.lock();
            let idx = files.iter().position(|f| f.file_id == file_id);
            idx.map(|i| files.remove(i))
        };
        match removed {
            None => false,
            Some(file) => {
                let (end_byte, direct_blocks) = file.snapshot();
                self.free_blocks(end_byte, &direct_blocks);
                clear_bit(&mut self.bitmap.lock(), file.info_block);
                true
            }
        }
    }

    /// Scan the bitmap for the first word that isn't all ones, claim its lowest clear bit, and
    /// flush. Returns [`NO_BLOCK`] if the disk is full.
    pub fn free_block(&self) -> u32 {
        let found = {
            let mut bitmap = self.bitmap.lock();
            let mut found = None;
            for (i, word) in bitmap.iter_mut().enumerate() {
                if *word != u32::MAX {
                    let bit = (0..32u32).find(|b| *word & (1 << b) == 0).unwrap();
                    *word |= 1 << bit;
                    found = Some(bit + i as u32 * 32);
                    break;
                }
            }
            found
        };
        match found {
            Some(block_no) => {
                self.flush_bitmap();
                block_no
            }
            None => {
                printk!("FileSystem::free_block: no free blocks left\n");
                NO_BLOCK
            }
        }
    }

    /// Clear the bits for a file's data blocks (`direct_blocks[0..=end_byte/512]`) and flush. A
    /// no-op for a file that never wrote anything (`end_byte == -1`).
    fn free_blocks(&self, end_byte: i32, direct_blocks: &[u32; DIRECT_BLOCKS]) {
        if end_byte < 0 {
            return;
        }
        let last_idx = (end_byte as u32 / 512) as usize;
        {
            let mut bitmap = self.bitmap.lock();
            for block_no in &direct_blocks[..=last_idx] {
                clear_bit(&mut bitmap, *block_no);
            }
        }
        self.flush_bitmap();
    }

    /// Blocks currently marked free, across the whole bitmap. Diagnostic/test use only; nothing
    /// in the operational protocol consults this directly.
    pub fn free_block_count(&self) -> usize {
        self.bitmap.lock().iter().map(|w| w.count_zeros() as usize).sum()
    }

    fn flush_bitmap(&self) {
        let bitmap = self.bitmap.lock();
        let mut buf = [0u8; 512];
        // A bitmap larger than one block silently loses its tail past the first 512 bytes here:
        // `write` only ever moves 512 bytes regardless of the source array's real length.
        for (i, word) in bitmap.iter().enumerate().take(512 / 4) {
            buf[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        self.disk.device.write(0, &buf);
    }

    fn write_info_block(&self, info_block: u32, direct_blocks: &[u32; DIRECT_BLOCKS]) {
        let mut buf = [0u8; 512];
        for (i, b) in direct_blocks.iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&b.to_le_bytes());
        }
        self.disk.device.write(info_block, &buf);
    }
}

struct FileState {
    direct_blocks: [u32; DIRECT_BLOCKS],
    cur_byte: u32,
    /// `-1` for an empty file; otherwise the index of the last valid byte.
    end_byte: i32,
    buffer: [u8; 512],
}

/// A byte-addressed view over up to [`DIRECT_BLOCKS`] data blocks on one [`FileSystem`].
pub struct File {
    file_id: u32,
    info_block: u32,
    state: Mutex<FileState>,
    fs: &'static FileSystem,
}

impl File {
    fn new(file_id: u32, info_block: u32, fs: &'static FileSystem) -> &'static File {
        Box::leak(Box::new(File {
            file_id,
            info_block,
            state: Mutex::new(FileState {
                direct_blocks: [0; DIRECT_BLOCKS],
                cur_byte: 0,
                end_byte: -1,
                buffer: [0; 512],
            }),
            fs,
        }))
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    fn snapshot(&self) -> (i32, [u32; DIRECT_BLOCKS]) {
        let state = self.state.lock();
        (state.end_byte, state.direct_blocks)
    }

    /// Copy up to `out.len()` bytes starting at the current position into `out`, stopping at
    /// `end_byte`; never reads past it. Returns the number of bytes actually copied.
    pub fn read(&self, out: &mut [u8]) -> u32 {
        let mut state = self.state.lock();
        let mut read_ptr = 0usize;
        let mut remaining = out.len() as u32;

        while remaining > 0
            && state.end_byte >= 0
            && (state.cur_byte as i64) <= state.end_byte as i64
        {
            if state.cur_byte % 512 == 0 {
                let block_idx = (state.cur_byte / 512) as usize;
                let block_no = state.direct_blocks[block_idx];
                let mut buf = state.buffer;
                self.fs.disk.device.read(block_no, &mut buf);
                state.buffer = buf;
            }
            let offset = (state.cur_byte % 512) as usize;
            out[read_ptr] = state.buffer[offset];
            read_ptr += 1;
            state.cur_byte += 1;
            remaining -= 1;
        }

        read_ptr as u32
    }

    /// Write `input` starting at the current position, growing the file and allocating fresh data
    /// blocks on demand via [`FileSystem::free_block`]. Resuming into an already-allocated block
    /// reloads its existing content first, so bytes outside the write range survive; a genuinely
    /// new block is zero-filled, so a trailing partial write is zero-padded. Panics if the write
    /// would need an 8th direct block.
    pub fn write(&self, input: &[u8]) {
        let mut state = self.state.lock();
        let mut write_ptr = 0usize;
        let mut remaining = input.len() as u32;

        while remaining > 0 {
            let block_idx = (state.cur_byte / 512) as usize;
            kernel_assert!(
                block_idx < DIRECT_BLOCKS,
                "file exceeds the {}-block direct fan-out",
                DIRECT_BLOCKS
            );

            if state.cur_byte % 512 == 0 {
                if state.direct_blocks[block_idx] != 0 {
                    let block_no = state.direct_blocks[block_idx];
                    let mut buf = state.buffer;
                    self.fs.disk.device.read(block_no, &mut buf);
                    state.buffer = buf;
                } else {
                    state.buffer = [0u8; 512];
                }
            }

            let offset = (state.cur_byte % 512) as usize;
            state.buffer[offset] = input[write_ptr];
            write_ptr += 1;
            state.cur_byte += 1;
            remaining -= 1;

            if state.cur_byte % 512 == 0 || remaining == 0 {
                let block_no = if state.direct_blocks[block_idx] == 0 {
                    let new_block = self.fs.free_block();
                    state.direct_blocks[block_idx] = new_block;
                    self.fs.write_info_block(self.info_block, &state.direct_blocks);
                    new_block
                } else {
                    state.direct_blocks[block_idx]
                };
                let buf = state.buffer;
                self.fs.disk.device.write(block_no, &buf);
            }
        }

        state.end_byte = state.cur_byte as i32 - 1;
    }

    pub fn reset(&self) {
        self.state.lock().cur_byte = 0;
    }

    /// Frees all data blocks and empties the file without deleting it. `direct_blocks` is cleared
    /// to all-zero along with it: `write` treats `0` as "not yet allocated", so a rewritten file's
    /// next `write` must see zeroed slots to allocate fresh blocks rather than reusing now-freed
    /// ones.
    pub fn rewrite(&self) {
        let mut state = self.state.lock();
        self.fs.free_blocks(state.end_byte, &state.direct_blocks);
        state.direct_blocks = [0; DIRECT_BLOCKS];
        state.cur_byte = 0;
        state.end_byte = -1;
    }

    pub fn eof(&self) -> bool {
        let state = self.state.lock();
        state.end_byte < 0 || state.cur_byte as i64 >= state.end_byte as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeDisk {
        blocks: Mutex<alloc::vec::Vec<[u8; 512]>>,
    }

    impl FakeDisk {
        fn new(n_blocks: usize) -> Self {
            FakeDisk {
                blocks: Mutex::new(alloc::vec![[0u8; 512]; n_blocks]),
            }
        }
    }

    impl SimpleDisk for FakeDisk {
        fn read(&self, block_no: u32, buf: &mut [u8; 512]) {
            *buf = self.blocks.lock()[block_no as usize];
        }

        fn write(&self, block_no: u32, buf: &[u8; 512]) {
            self.blocks.lock()[block_no as usize] = *buf;
        }
    }

    fn mounted(n_blocks: usize) -> &'static FileSystem {
        let device: &'static FakeDisk = Box::leak(Box::new(FakeDisk::new(n_blocks)));
        let disk = Disk::new(device);
        FileSystem::format(disk, (n_blocks * 512) as u32);
        FileSystem::mount(disk)
    }

    #[test]
    fn property9_write_reset_read_round_trips() {
        let fs = mounted(64);
        assert!(fs.create_file(7));
        let file = fs.lookup_file(7).unwrap();

        let mut data = alloc::vec::Vec::new();
        for i in 0..3000u32 {
            data.push((i % 251) as u8);
        }
        file.write(&data);
        file.reset();

        let mut out = alloc::vec![0u8; data.len()];
        let n = file.read(&mut out);
        assert_eq!(n as usize, data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn e4_partial_block_round_trip_and_eof() {
        let fs = mounted(64);
        assert!(fs.create_file(42));
        let file = fs.lookup_file(42).unwrap();

        let data: alloc::vec::Vec<u8> = (0..800u32).map(|i| (i % 256) as u8).collect();
        file.write(&data);
        file.reset();

        let mut out = alloc::vec![0u8; 800];
        assert_eq!(file.read(&mut out), 800);
        assert_eq!(out, data);
        assert!(file.eof());
    }

    #[test]
    fn property10_rewrite_frees_back_to_post_create_level() {
        let fs = mounted(64);
        assert!(fs.create_file(1));
        let after_create = fs.free_block_count();

        let file = fs.lookup_file(1).unwrap();
        file.write(&alloc::vec![0xAB; 512 * 3]);
        assert!(fs.free_block_count() < after_create);

        file.rewrite();
        assert_eq!(fs.free_block_count(), after_create);
    }

    #[test]
    fn e5_delete_file_frees_info_and_data_blocks() {
        let fs = mounted(64);
        let before_create = fs.free_block_count();
        assert!(fs.create_file(1));

        let file = fs.lookup_file(1).unwrap();
        file.write(&alloc::vec![0x11; 512]);

        assert!(fs.delete_file(1));
        assert_eq!(fs.free_block_count(), before_create);
        assert!(fs.lookup_file(1).is_none());
    }

    #[test]
    fn create_file_with_existing_id_fails() {
        let fs = mounted(64);
        assert!(fs.create_file(9));
        assert!(!fs.create_file(9));
    }

    #[test]
    #[should_panic(expected = "direct fan-out")]
    fn write_past_seven_blocks_panics() {
        let fs = mounted(64);
        fs.create_file(1);
        let file = fs.lookup_file(1).unwrap();
        file.write(&alloc::vec![0u8; MAX_FILE_SIZE as usize + 1]);
    }
}
