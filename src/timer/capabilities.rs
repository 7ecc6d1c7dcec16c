use super::{Error, NtStatus, Result, resolution::NtTimer};
use std::{
    ffi::{CStr, c_void},
    mem,
    ptr::NonNull,
};
pub const NTDLL: &str = "ntdll.dll";
pub const KERNEL32: &str = "kernel32.dll";
pub const NT_QUERY_TIMER_RESOLUTION: &CStr = c"NtQueryTimerResolution";
pub const NT_SET_TIMER_RESOLUTION: &CStr = c"NtSetTimerResolution";
pub const SET_PROCESS_INFORMATION: &CStr = c"SetProcessInformation";
pub type QueryTimerResolution =
    unsafe extern "system" fn(minimum: *mut u32, maximum: *mut u32, current: *mut u32) -> NtStatus;
pub type SetTimerResolution =
    unsafe extern "system" fn(desired: u32, set: u8, current: *mut u32) -> NtStatus;
pub type SetProcessInformation = unsafe extern "system" fn(
    process: *mut c_void,
    information_class: i32,
    information: *const c_void,
    information_size: u32,
) -> i32;
const PROCESS_POWER_THROTTLING: i32 = 4;
const PROCESS_POWER_THROTTLING_CURRENT_VERSION: u32 = 1;
const PROCESS_POWER_THROTTLING_IGNORE_TIMER_RESOLUTION: u32 = 0x4;
pub trait ModuleLoader {
    type Module: Copy;
    fn load(&self, name: &'static str) -> Option<Self::Module>;
    fn export(&self, module: Self::Module, symbol: &CStr) -> Option<NonNull<c_void>>;
}
pub enum Symbol<F> {
    Found(F),
    NotFound(&'static CStr),
}
impl<F: Copy> Symbol<F> {
    /// Looks up `name` in `module` and reinterprets the address as `F`.
    ///
    /// # Safety
    ///
    /// `F` must be a function pointer type matching the real signature of the
    /// export.
    pub unsafe fn lookup<L: ModuleLoader>(
        loader: &L,
        module: L::Module,
        name: &'static CStr,
    ) -> Self {
        const { assert!(mem::size_of::<F>() == mem::size_of::<NonNull<c_void>>()) };
        match loader.export(module, name) {
            Some(address) => Symbol::Found(unsafe { mem::transmute_copy(&address) }),
            None => Symbol::NotFound(name),
        }
    }
    pub fn require(self) -> Result<F> {
        match self {
            Symbol::Found(function) => Ok(function),
            Symbol::NotFound(name) => Err(Error::MissingExport(name)),
        }
    }
    pub fn ok(self) -> Option<F> {
        match self {
            Symbol::Found(function) => Some(function),
            Symbol::NotFound(_) => None,
        }
    }
}
/// Handles of the libraries the exports live in. Never freed: the resolved
/// functions have to stay callable until the process dies.
pub struct Libraries<M> {
    ntdll: M,
    kernel32: M,
}
impl<M: Copy> Libraries<M> {
    pub fn load<L: ModuleLoader<Module = M>>(loader: &L) -> Result<Self> {
        let load = |name: &'static str| -> Result<M> {
            let module = loader.load(name).ok_or(Error::LibraryLoad(name))?;
            tracing::debug!(library = name, "loaded");
            Ok(module)
        };
        Ok(Self {
            ntdll: load(NTDLL)?,
            kernel32: load(KERNEL32)?,
        })
    }
}
pub struct Capabilities {
    pub timer: NtTimer,
    pub throttling: Option<PowerThrottling>,
}
impl Capabilities {
    pub fn resolve<L: ModuleLoader>(loader: &L, libraries: &Libraries<L::Module>) -> Result<Self> {
        let (ntdll, kernel32) = (libraries.ntdll, libraries.kernel32);
        let (query, set, set_process_information) = unsafe {
            (
                Symbol::<QueryTimerResolution>::lookup(loader, ntdll, NT_QUERY_TIMER_RESOLUTION),
                Symbol::<SetTimerResolution>::lookup(loader, ntdll, NT_SET_TIMER_RESOLUTION),
                Symbol::<SetProcessInformation>::lookup(loader, kernel32, SET_PROCESS_INFORMATION),
            )
        };
        let timer = NtTimer::new(query.require()?, set.require()?);
        // Not exported before Windows 8.
        let throttling = set_process_information.ok().map(PowerThrottling::new);
        tracing::debug!(throttling = throttling.is_some(), "resolved timer exports");
        Ok(Self { timer, throttling })
    }
}
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ThrottlingState {
    pub version: u32,
    pub control_mask: u32,
    pub state_mask: u32,
}
const _: [(); 12] = [(); mem::size_of::<ThrottlingState>()];
impl ThrottlingState {
    pub(crate) const IGNORE_TIMER_RESOLUTION: Self = Self {
        version: PROCESS_POWER_THROTTLING_CURRENT_VERSION,
        control_mask: PROCESS_POWER_THROTTLING_IGNORE_TIMER_RESOLUTION,
        state_mask: 0,
    };
}
pub struct PowerThrottling {
    set_process_information: SetProcessInformation,
}
impl PowerThrottling {
    pub fn new(set_process_information: SetProcessInformation) -> Self {
        Self {
            set_process_information,
        }
    }
    /// Opts `process` out of timer resolution throttling. Best effort, the
    /// result only ends up in the debug log.
    pub fn ignore_timer_resolution(&self, process: *mut c_void) {
        let state = ThrottlingState::IGNORE_TIMER_RESOLUTION;
        let Ok(size) = u32::try_from(mem::size_of::<ThrottlingState>()) else {
            return;
        };
        let applied = unsafe {
            (self.set_process_information)(
                process,
                PROCESS_POWER_THROTTLING,
                (&raw const state).cast(),
                size,
            )
        };
        tracing::debug!(applied, "SetProcessInformation(ProcessPowerThrottling)");
    }
}
