use super::{Error, Result};
use anyhow::Context;
use std::env;
pub const DEFAULT_IMAGE_NAME: &str = "SetTimerResolution.exe";
pub fn own_image_name() -> String {
    let image_name = env::current_exe()
        .context("failed to locate the running executable")
        .and_then(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(str::to_owned)
                .context("executable path has no usable file name")
        });
    match image_name {
        Ok(image_name) => image_name,
        Err(e) => {
            tracing::debug!("{e:#}, falling back to {DEFAULT_IMAGE_NAME}");
            DEFAULT_IMAGE_NAME.to_owned()
        }
    }
}
pub fn count_matching<I>(names: I, image_name: &str) -> usize
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    names
        .into_iter()
        .filter(|name| name.as_ref().eq_ignore_ascii_case(image_name))
        .count()
}
/// The running process always sees itself, so only a count above one means
/// another copy holds the timer.
pub fn ensure_single_instance(count: usize, image_name: &str) -> Result<()> {
    if count > 1 {
        return Err(Error::AlreadyRunning {
            image_name: image_name.to_owned(),
            count,
        });
    }
    Ok(())
}
#[cfg(target_os = "windows")]
pub use snapshot::count_matching_processes;
#[cfg(target_os = "windows")]
mod snapshot {
    use std::mem;
    use windows_sys::Win32::{
        Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE},
        System::Diagnostics::ToolHelp::{
            CreateToolhelp32Snapshot, PROCESSENTRY32W, Process32FirstW, Process32NextW,
            TH32CS_SNAPPROCESS,
        },
    };
    struct Snapshot(HANDLE);
    impl Snapshot {
        fn processes() -> Option<Self> {
            let handle = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
            if handle == INVALID_HANDLE_VALUE || handle.is_null() {
                return None;
            }
            Some(Self(handle))
        }
        fn image_names(&self) -> ImageNames<'_> {
            ImageNames {
                snapshot: self,
                entry: None,
                exhausted: false,
            }
        }
    }
    impl Drop for Snapshot {
        fn drop(&mut self) {
            unsafe {
                CloseHandle(self.0);
            }
        }
    }
    struct ImageNames<'a> {
        snapshot: &'a Snapshot,
        entry: Option<PROCESSENTRY32W>,
        exhausted: bool,
    }
    impl Iterator for ImageNames<'_> {
        type Item = String;
        fn next(&mut self) -> Option<String> {
            if self.exhausted {
                return None;
            }
            let found = match self.entry.as_mut() {
                Some(entry) => unsafe { Process32NextW(self.snapshot.0, entry) },
                None => {
                    let Ok(size) = u32::try_from(mem::size_of::<PROCESSENTRY32W>()) else {
                        return None;
                    };
                    let entry = self.entry.insert(unsafe { mem::zeroed() });
                    entry.dwSize = size;
                    unsafe { Process32FirstW(self.snapshot.0, entry) }
                }
            };
            if found == 0 {
                self.exhausted = true;
                return None;
            }
            let exe_file = &self.entry.as_ref()?.szExeFile;
            let len = exe_file.iter().position(|&c| c == 0).unwrap_or(exe_file.len());
            Some(String::from_utf16_lossy(&exe_file[..len]))
        }
    }
    impl std::iter::FusedIterator for ImageNames<'_> {}
    pub fn count_matching_processes(image_name: &str) -> usize {
        let Some(snapshot) = Snapshot::processes() else {
            tracing::debug!("process snapshot unavailable, assuming no other instance is running");
            return 0;
        };
        super::count_matching(snapshot.image_names(), image_name)
    }
}
