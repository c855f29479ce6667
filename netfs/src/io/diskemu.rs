use crate::io::{BlockNumber, BlockStorage};
use crate::layout::BLOCK_SIZE;
use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Emulates block disk/flash storage in userspace using a file as block storage.
pub struct FileBlockEmulator {
    /// The file must be a fixed-size file some exact multiple of the size of a block.
    fd: Mutex<File>,
    /// The total number of blocks available in the file store.
    block_count: usize,
}

impl FileBlockEmulator {
    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn file(&self) -> MutexGuard<'_, File> {
        self.fd.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_range(&self, blocknr: BlockNumber) -> std::io::Result<()> {
        if blocknr >= self.block_count {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("block {} out of range", blocknr),
            ));
        }
        Ok(())
    }
}

impl BlockStorage for FileBlockEmulator {
    fn open_disk<P: AsRef<Path>>(dest: P, nblocks: usize) -> std::io::Result<Self>
    where
        Self: std::marker::Sized,
    {
        // Return error if the file does not exist rather than create one.
        let file = OpenOptions::new().read(true).write(true).open(dest)?;
        FileBlockEmulatorBuilder::from(file)
            .with_block_count(nblocks)
            .clear_medium(false)
            .build()
    }

    fn read_block(&self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        self.check_range(blocknr)?;
        if buf.len() < BLOCK_SIZE {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer does not contain enough space to read block",
            ));
        }

        let mut fd = self.file();
        fd.seek(SeekFrom::Start((blocknr * BLOCK_SIZE) as u64))?;
        fd.read_exact(&mut buf[..BLOCK_SIZE])
    }

    /// This method truncates writes that exceed the total block size.
    fn write_block(&self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        self.check_range(blocknr)?;

        let max = buf.len().min(BLOCK_SIZE);
        let mut fd = self.file();
        fd.seek(SeekFrom::Start((blocknr * BLOCK_SIZE) as u64))?;
        fd.write_all(&buf[..max])
    }

    fn sync_disk(&self) -> std::io::Result<()> {
        self.file().sync_all()
    }

    fn block_count(&self) -> usize {
        self.block_count
    }
}

pub struct FileBlockEmulatorBuilder {
    fd: File,
    block_count: usize,
    clear: bool,
}

impl From<File> for FileBlockEmulatorBuilder {
    fn from(fd: File) -> Self {
        FileBlockEmulatorBuilder {
            fd,
            block_count: 0,
            clear: true,
        }
    }
}

impl FileBlockEmulatorBuilder {
    /// Sets the number of desired blocks in the block store device.
    pub fn with_block_count(mut self, blocks: usize) -> Self {
        self.block_count = blocks;
        self
    }

    /// Whether `build` zeroes the medium. Defaults to true; turn it off to reopen a
    /// disk image that already holds a file system.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear = clear;
        self
    }

    /// This builder assumes ownership of the file descriptor used and, unless told
    /// otherwise, does destructive things to prepare the file for use.
    pub fn build(mut self) -> std::io::Result<FileBlockEmulator> {
        if self.block_count == 0 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "block device needs at least one block",
            ));
        }

        let wanted = (self.block_count * BLOCK_SIZE) as u64;
        if self.clear {
            self.zero_blocks()?;
        } else if self.fd.metadata()?.len() < wanted {
            // Short images are padded with zeroed blocks.
            self.fd.set_len(wanted)?;
        }

        Ok(FileBlockEmulator {
            fd: Mutex::new(self.fd),
            block_count: self.block_count,
        })
    }

    fn zero_blocks(&mut self) -> std::io::Result<()> {
        self.fd.set_len(0)?;
        self.fd.seek(SeekFrom::Start(0))?;
        let mut bfd = BufWriter::new(&self.fd);
        // Zero out the "disk", buffering each write to prevent excessive syscalls.
        for _ in 0..self.block_count {
            bfd.write_all(&[0x00; BLOCK_SIZE])?;
        }
        bfd.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emulator(blocks: usize) -> FileBlockEmulator {
        let fs_block = tempfile::tempfile().unwrap();
        FileBlockEmulatorBuilder::from(fs_block)
            .with_block_count(blocks)
            .build()
            .expect("failed to allocate file block")
    }

    #[test]
    fn file_emulator_allocates_correct_num_bytes() {
        let disk_emu = emulator(4);
        disk_emu.sync_disk().unwrap();
        assert_eq!(
            disk_emu.into_file().metadata().unwrap().len(),
            4 * BLOCK_SIZE as u64
        );
    }

    #[test]
    fn can_read_and_write_blocks() {
        let disk_emu = emulator(4);

        let block = vec![0x55; BLOCK_SIZE];
        disk_emu.write_block(2, &block).unwrap();

        // Read a different block.
        let mut read_block = vec![0x00; BLOCK_SIZE];
        disk_emu.read_block(3, &mut read_block).unwrap();
        assert_eq!(read_block, vec![0x00; BLOCK_SIZE]);

        let mut filled_block = vec![0x00; BLOCK_SIZE];
        disk_emu.read_block(2, &mut filled_block).unwrap();
        assert_eq!(filled_block, vec![0x55; BLOCK_SIZE]);
    }

    #[test]
    fn can_read_and_write_start_and_end_blocks() {
        let disk_emu = emulator(2);

        disk_emu.write_block(0, &[0x11; BLOCK_SIZE]).unwrap();
        disk_emu.write_block(1, &[0x22; BLOCK_SIZE]).unwrap();

        let mut read_block = [0x00; BLOCK_SIZE];
        disk_emu.read_block(0, &mut read_block).unwrap();
        assert_eq!(read_block, [0x11; BLOCK_SIZE]);
        disk_emu.read_block(1, &mut read_block).unwrap();
        assert_eq!(read_block, [0x22; BLOCK_SIZE]);
    }

    #[test]
    fn access_beyond_range_is_an_error() {
        let disk_emu = emulator(1);

        let wresult = disk_emu.write_block(1, &[0x55; BLOCK_SIZE]);
        assert_eq!(wresult.unwrap_err().kind(), ErrorKind::InvalidInput);

        let mut buf = [0; BLOCK_SIZE];
        assert!(disk_emu.read_block(1, &mut buf).is_err());
    }

    #[test]
    fn short_read_buffer_is_rejected() {
        let disk_emu = emulator(1);
        let mut buf = [0; BLOCK_SIZE / 2];
        assert!(disk_emu.read_block(0, &mut buf).is_err());
    }

    #[test]
    fn writing_partial_block_leaves_remainder_untouched() {
        let disk_emu = emulator(1);
        disk_emu.write_block(0, &[0x55; BLOCK_SIZE / 2]).unwrap();

        let mut buf = [0xff; BLOCK_SIZE];
        disk_emu.read_block(0, &mut buf).unwrap();
        assert_eq!(&buf[..BLOCK_SIZE / 2], &[0x55; BLOCK_SIZE / 2][..]);
        assert_eq!(&buf[BLOCK_SIZE / 2..], &[0x00; BLOCK_SIZE / 2][..]);
    }

    #[test]
    fn reopening_without_clearing_keeps_contents() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let first = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
            .with_block_count(3)
            .build()
            .unwrap();
        first.write_block(1, &[0x42; BLOCK_SIZE]).unwrap();
        first.sync_disk().unwrap();

        let second = FileBlockEmulator::open_disk(disk.path(), 3).unwrap();
        let mut buf = [0; BLOCK_SIZE];
        second.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, [0x42; BLOCK_SIZE]);
    }

    #[test]
    fn zero_block_device_is_rejected() {
        let result = FileBlockEmulatorBuilder::from(tempfile::tempfile().unwrap()).build();
        assert!(result.is_err());
    }
}
