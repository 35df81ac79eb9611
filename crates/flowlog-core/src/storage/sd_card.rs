use embedded_sdmmc::{Mode, SdCard, SdCardError, TimeSource, VolumeIdx, VolumeManager};

use super::{Storage, StorageError};

type SdError = embedded_sdmmc::Error<SdCardError>;

/// FAT storage on an SPI-attached SD card.
///
/// Every operation opens the volume, root directory and file, and closes them
/// again before returning, so nothing is left half-open across a reset. This
/// is slower than holding handles but appends are only a few per minute.
/// File names must be 8.3.
pub struct SdCardStorage<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    volume_mgr: VolumeManager<SdCard<S, D>, T, 4, 4, 1>,
}

impl<S, D, T> SdCardStorage<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    pub fn new(sd_card: SdCard<S, D>, ts: T) -> Self {
        let volume_mgr = VolumeManager::new(sd_card, ts);

        Self { volume_mgr }
    }

    fn append_inner(&self, name: &str, bytes: &[u8]) -> Result<(), SdError> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;
        let file = root_dir.open_file_in_dir(name, Mode::ReadWriteCreateOrAppend)?;

        file.write(bytes)?;

        // Explicitly close to surface flush errors instead of dropping them
        file.close()?;
        root_dir.close()?;
        volume0.close()?;

        Ok(())
    }

    fn len_inner(&self, name: &str) -> Result<u32, SdError> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;
        let entry = root_dir.find_directory_entry(name)?;

        root_dir.close()?;
        volume0.close()?;

        Ok(entry.size)
    }

    fn read_inner(&self, name: &str, offset: u32, buf: &mut [u8]) -> Result<usize, SdError> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;
        let file = root_dir.open_file_in_dir(name, Mode::ReadOnly)?;

        let mut count = 0;
        if offset < file.length() {
            file.seek_from_start(offset)?;
            while count < buf.len() {
                let n = file.read(&mut buf[count..])?;
                if n == 0 {
                    break; // EOF
                }
                count += n;
            }
        }

        file.close()?;
        root_dir.close()?;
        volume0.close()?;

        Ok(count)
    }

    fn remove_inner(&self, name: &str) -> Result<(), SdError> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;

        root_dir.delete_file_in_dir(name)?;

        root_dir.close()?;
        volume0.close()?;

        Ok(())
    }
}

fn map_error(error: SdError) -> StorageError {
    match error {
        embedded_sdmmc::Error::NotFound => StorageError::NotFound,
        embedded_sdmmc::Error::FilenameError(_) => StorageError::InvalidName,
        embedded_sdmmc::Error::NotEnoughSpace => StorageError::Full,
        other => {
            log::error!("SD card error: {:?}", other);
            StorageError::Device
        }
    }
}

impl<S, D, T> Storage for SdCardStorage<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    fn append(&mut self, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.append_inner(name, bytes).map_err(map_error)
    }

    fn exists(&mut self, name: &str) -> bool {
        self.len_inner(name).is_ok()
    }

    fn len(&mut self, name: &str) -> Result<u32, StorageError> {
        self.len_inner(name).map_err(map_error)
    }

    fn read_at(&mut self, name: &str, offset: u32, buf: &mut [u8]) -> Result<usize, StorageError> {
        self.read_inner(name, offset, buf).map_err(map_error)
    }

    fn remove(&mut self, name: &str) -> Result<(), StorageError> {
        self.remove_inner(name).map_err(map_error)
    }
}
