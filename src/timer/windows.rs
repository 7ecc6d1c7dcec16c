use super::{Host, Parked, capabilities::ModuleLoader, instance_guard};
use std::{
    ffi::{CStr, c_void},
    iter,
    ptr::NonNull,
};
use windows_sys::Win32::{
    Foundation::HMODULE,
    System::{
        Console::FreeConsole,
        LibraryLoader::{GetProcAddress, LoadLibraryW},
        Threading::{GetCurrentProcess, INFINITE, Sleep},
    },
};
pub struct WindowsHost;
impl ModuleLoader for WindowsHost {
    type Module = HMODULE;
    fn load(&self, name: &'static str) -> Option<HMODULE> {
        let wide: Vec<u16> = name.encode_utf16().chain(iter::once(0)).collect();
        let module = unsafe { LoadLibraryW(wide.as_ptr()) };
        (!module.is_null()).then_some(module)
    }
    fn export(&self, module: HMODULE, symbol: &CStr) -> Option<NonNull<c_void>> {
        let address = unsafe { GetProcAddress(module, symbol.as_ptr().cast()) }?;
        NonNull::new(address as *mut c_void)
    }
}
impl Host for WindowsHost {
    fn count_instances(&self, image_name: &str) -> usize {
        instance_guard::count_matching_processes(image_name)
    }
    fn detach_console(&self) {
        unsafe {
            FreeConsole();
        }
    }
    fn current_process(&self) -> *mut c_void {
        unsafe { GetCurrentProcess() }
    }
    fn park(&self) -> Parked {
        tracing::debug!("holding timer resolution until terminated");
        loop {
            unsafe { Sleep(INFINITE) }
        }
    }
}
