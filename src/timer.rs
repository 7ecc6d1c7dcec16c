use std::{
    ffi::{CStr, c_void},
    fmt,
    io::{self, Write},
    path::Path,
    result as stdresult,
};
pub mod capabilities;
pub mod instance_guard;
pub mod resolution;
#[cfg(target_os = "windows")]
pub mod windows;
use capabilities::{Capabilities, Libraries, ModuleLoader};
use resolution::ResolutionTriple;
pub type NtStatus = i32;
pub const STATUS_SUCCESS: NtStatus = 0;
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "Another instance of {} is already running. Close all instances and try again",
        program_name(.image_name)
    )]
    AlreadyRunning { image_name: String, count: usize },
    #[error("LoadLibrary failed: {0}")]
    LibraryLoad(&'static str),
    #[error("{} could not be resolved", .0.to_string_lossy())]
    MissingExport(&'static CStr),
    #[error("NtQueryTimerResolution failed (status {0:#010X})")]
    Query(NtStatus),
    #[error("NtSetTimerResolution failed (status {0:#010X})")]
    Set(NtStatus),
}
pub type Result<T> = stdresult::Result<T, Error>;
fn program_name(image_name: &str) -> &str {
    Path::new(image_name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(image_name)
}
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Start,
    GuardCheck,
    LoadLibs,
    ResolveSymbols,
    ThrottleExempt,
    Query,
    Set,
    Report,
    Parked,
}
impl Stage {
    pub const fn next(self) -> Option<Self> {
        match self {
            Stage::Start => Some(Stage::GuardCheck),
            Stage::GuardCheck => Some(Stage::LoadLibs),
            Stage::LoadLibs => Some(Stage::ResolveSymbols),
            Stage::ResolveSymbols => Some(Stage::ThrottleExempt),
            Stage::ThrottleExempt => Some(Stage::Query),
            Stage::Query => Some(Stage::Set),
            Stage::Set => Some(Stage::Report),
            Stage::Report => Some(Stage::Parked),
            Stage::Parked => None,
        }
    }
    pub const fn is_terminal(self) -> bool {
        self.next().is_none()
    }
}
#[derive(Clone, Debug)]
pub struct Request {
    /// Desired resolution in 100-ns units, passed to the kernel unmodified.
    pub resolution: u32,
    pub detach_console: bool,
    pub image_name: String,
}
/// Proof that the pipeline reached its terminal state. The Windows host never
/// hands one back; its park blocks for the lifetime of the process.
#[derive(Debug)]
pub struct Parked;
/// Everything the pipeline needs from the operating system.
pub trait Host: ModuleLoader {
    fn count_instances(&self, image_name: &str) -> usize;
    fn detach_console(&self);
    fn current_process(&self) -> *mut c_void;
    fn park(&self) -> Parked;
}
#[derive(Debug)]
pub struct Fatal {
    pub stage: Stage,
    pub error: Error,
}
impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}
impl std::error::Error for Fatal {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
pub struct Pipeline<'h, H: Host> {
    host: &'h H,
    stage: Stage,
}
impl<'h, H: Host> Pipeline<'h, H> {
    pub fn new(host: &'h H) -> Self {
        Self {
            host,
            stage: Stage::Start,
        }
    }
    #[cfg(test)]
    pub fn stage(&self) -> Stage {
        self.stage
    }
    fn advance(&mut self) {
        if self.stage.is_terminal() {
            return;
        }
        if let Some(next) = self.stage.next() {
            tracing::debug!(from = ?self.stage, to = ?next, "stage transition");
            self.stage = next;
        }
    }
    pub fn run<W: Write>(
        &mut self,
        request: &Request,
        out: &mut W,
    ) -> stdresult::Result<Parked, Fatal> {
        match self.run_stages(request, out) {
            Ok(parked) => Ok(parked),
            Err(error) => {
                tracing::debug!(stage = ?self.stage, %error, "pipeline aborted");
                Err(Fatal {
                    stage: self.stage,
                    error,
                })
            }
        }
    }
    fn run_stages<W: Write>(&mut self, request: &Request, out: &mut W) -> Result<Parked> {
        let host = self.host;
        self.advance();
        let count = host.count_instances(&request.image_name);
        instance_guard::ensure_single_instance(count, &request.image_name)?;
        if request.detach_console {
            tracing::debug!("detaching console");
            host.detach_console();
        }
        self.advance();
        let libraries = Libraries::load(host)?;
        self.advance();
        let capabilities = Capabilities::resolve(host, &libraries)?;
        self.advance();
        match &capabilities.throttling {
            Some(throttling) => throttling.ignore_timer_resolution(host.current_process()),
            None => tracing::debug!("SetProcessInformation unavailable, throttling left as is"),
        }
        self.advance();
        let mut triple = capabilities.timer.query()?;
        tracing::debug!(
            minimum = triple.minimum,
            maximum = triple.maximum,
            current = triple.current,
            "queried timer resolution"
        );
        self.advance();
        capabilities.timer.set(request.resolution, &mut triple)?;
        self.advance();
        if let Err(e) = report(&triple, out) {
            tracing::debug!(error = %e, "resolution report not written");
        }
        self.advance();
        Ok(host.park())
    }
}
fn report<W: Write>(triple: &ResolutionTriple, out: &mut W) -> io::Result<()> {
    writeln!(out, "{}", resolution::format_report(triple.current))?;
    out.flush()?;
    Ok(())
}
#[cfg(test)]
mod tests {
    use super::{
        capabilities::{
            NT_QUERY_TIMER_RESOLUTION, NT_SET_TIMER_RESOLUTION, QueryTimerResolution,
            SET_PROCESS_INFORMATION, SetProcessInformation, SetTimerResolution,
        },
        testing::FakeHost,
        *,
    };
    use std::cell::Cell;
    thread_local! {
        static QUERY_CALLS: Cell<usize> = const { Cell::new(0) };
        static SET_CALLS: Cell<usize> = const { Cell::new(0) };
        static LAST_DESIRED: Cell<Option<(u32, u8)>> = const { Cell::new(None) };
        static THROTTLE_CALLS: Cell<usize> = const { Cell::new(0) };
    }
    unsafe extern "system" fn query_ok(minimum: *mut u32, maximum: *mut u32, current: *mut u32) -> NtStatus {
        QUERY_CALLS.with(|calls| calls.set(calls.get() + 1));
        unsafe {
            *minimum = 156_250;
            *maximum = 5_000;
            *current = 156_250;
        }
        STATUS_SUCCESS
    }
    unsafe extern "system" fn query_fails(_: *mut u32, _: *mut u32, _: *mut u32) -> NtStatus {
        QUERY_CALLS.with(|calls| calls.set(calls.get() + 1));
        0xC000_0001_u32 as NtStatus
    }
    unsafe extern "system" fn set_rounds_to_5000(desired: u32, set: u8, current: *mut u32) -> NtStatus {
        SET_CALLS.with(|calls| calls.set(calls.get() + 1));
        LAST_DESIRED.with(|last| last.set(Some((desired, set))));
        unsafe { *current = 5_000 };
        STATUS_SUCCESS
    }
    unsafe extern "system" fn set_fails(_: u32, _: u8, _: *mut u32) -> NtStatus {
        SET_CALLS.with(|calls| calls.set(calls.get() + 1));
        0xC000_000D_u32 as NtStatus
    }
    unsafe extern "system" fn set_process_information(_: *mut c_void, _: i32, _: *const c_void, _: u32) -> i32 {
        THROTTLE_CALLS.with(|calls| calls.set(calls.get() + 1));
        0
    }
    fn host(query: QueryTimerResolution, set: SetTimerResolution) -> FakeHost {
        FakeHost::new()
            .with_export("ntdll.dll", NT_QUERY_TIMER_RESOLUTION, query as *mut c_void)
            .with_export("ntdll.dll", NT_SET_TIMER_RESOLUTION, set as *mut c_void)
    }
    fn with_throttling(host: FakeHost) -> FakeHost {
        let throttling: SetProcessInformation = set_process_information;
        host.with_export("kernel32.dll", SET_PROCESS_INFORMATION, throttling as *mut c_void)
    }
    fn request(resolution: u32) -> Request {
        Request {
            resolution,
            detach_console: false,
            image_name: "SetTimerResolution.exe".to_owned(),
        }
    }
    fn run(host: &FakeHost, request: &Request) -> (stdresult::Result<Parked, Fatal>, Stage, String) {
        let mut out = Vec::new();
        let mut pipeline = Pipeline::new(host);
        let result = pipeline.run(request, &mut out);
        let stage = pipeline.stage();
        (result, stage, String::from_utf8_lossy(&out).into_owned())
    }
    #[test]
    fn stages_advance_linearly_to_parked() {
        let mut stage = Stage::Start;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            stage = next;
            seen.push(stage);
        }
        assert_eq!(
            seen,
            [
                Stage::Start,
                Stage::GuardCheck,
                Stage::LoadLibs,
                Stage::ResolveSymbols,
                Stage::ThrottleExempt,
                Stage::Query,
                Stage::Set,
                Stage::Report,
                Stage::Parked,
            ]
        );
        assert!(Stage::Parked.is_terminal());
        assert!(!Stage::Report.is_terminal());
    }
    #[test]
    fn successful_run_reports_once_and_parks() {
        let host = with_throttling(host(query_ok, set_rounds_to_5000));
        let (result, stage, out) = run(&host, &request(5_000));
        assert!(result.is_ok());
        assert_eq!(stage, Stage::Parked);
        assert_eq!(out, "Resolution set to: 0.500000000000ms\n");
        assert!(host.parked.get());
        assert_eq!(LAST_DESIRED.with(Cell::get), Some((5_000, 1)));
        assert_eq!(QUERY_CALLS.with(Cell::get), 1);
        assert_eq!(SET_CALLS.with(Cell::get), 1);
        assert_eq!(THROTTLE_CALLS.with(Cell::get), 1);
        assert_eq!(*host.counted.borrow(), ["SetTimerResolution.exe"]);
    }
    #[test]
    fn parked_pipeline_makes_no_further_transitions() {
        let host = host(query_ok, set_rounds_to_5000);
        let mut out = Vec::new();
        let mut pipeline = Pipeline::new(&host);
        assert!(pipeline.run(&request(5_000), &mut out).is_ok());
        pipeline.advance();
        assert_eq!(pipeline.stage(), Stage::Parked);
    }
    #[test]
    fn requested_value_is_not_clamped_to_reported_bounds() {
        let host = host(query_ok, set_rounds_to_5000);
        let (result, _, _) = run(&host, &request(1));
        assert!(result.is_ok());
        assert_eq!(LAST_DESIRED.with(Cell::get), Some((1, 1)));
    }
    struct BrokenPipe;
    impl io::Write for BrokenPipe {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }
        fn flush(&mut self) -> io::Result<()> {
            Err(io::ErrorKind::BrokenPipe.into())
        }
    }
    #[test]
    fn unwritable_stdout_still_parks() {
        let host = host(query_ok, set_rounds_to_5000);
        let mut pipeline = Pipeline::new(&host);
        let result = pipeline.run(&request(5_000), &mut BrokenPipe);
        assert!(result.is_ok());
        assert_eq!(pipeline.stage(), Stage::Parked);
        assert!(host.parked.get());
        assert_eq!(SET_CALLS.with(Cell::get), 1);
    }
    #[test]
    fn program_name_drops_the_extension() {
        assert_eq!(program_name("SetTimerResolution.exe"), "SetTimerResolution");
        assert_eq!(program_name("SetTimerResolution"), "SetTimerResolution");
        assert_eq!(program_name("timer.tool.exe"), "timer.tool");
    }
    #[test]
    fn missing_throttling_export_is_tolerated() {
        let host = host(query_ok, set_rounds_to_5000);
        let (result, stage, out) = run(&host, &request(5_000));
        assert!(result.is_ok());
        assert_eq!(stage, Stage::Parked);
        assert_eq!(out, "Resolution set to: 0.500000000000ms\n");
        assert_eq!(THROTTLE_CALLS.with(Cell::get), 0);
    }
    #[test]
    fn second_instance_aborts_before_any_timer_call() {
        let mut host = host(query_ok, set_rounds_to_5000);
        host.instances = 2;
        let (result, stage, out) = run(&host, &request(5_000));
        let fatal = result.expect_err("guard must reject a second instance");
        assert_eq!(stage, Stage::GuardCheck);
        assert!(matches!(fatal.error, Error::AlreadyRunning { count: 2, .. }));
        assert_eq!(
            fatal.to_string(),
            "Another instance of SetTimerResolution is already running. Close all instances and try again"
        );
        assert!(out.is_empty());
        assert_eq!(QUERY_CALLS.with(Cell::get), 0);
        assert_eq!(SET_CALLS.with(Cell::get), 0);
        assert!(!host.parked.get());
    }
    #[test]
    fn failed_enumeration_lets_the_run_proceed() {
        let mut host = host(query_ok, set_rounds_to_5000);
        host.instances = 0;
        let (result, stage, _) = run(&host, &request(5_000));
        assert!(result.is_ok());
        assert_eq!(stage, Stage::Parked);
    }
    #[test]
    fn console_is_detached_only_on_request() {
        let host = host(query_ok, set_rounds_to_5000);
        let (result, _, _) = run(&host, &request(5_000));
        assert!(result.is_ok());
        assert!(!host.detached.get());
        let detached = Request {
            detach_console: true,
            ..request(5_000)
        };
        let (result, _, _) = run(&host, &detached);
        assert!(result.is_ok());
        assert!(host.detached.get());
    }
    #[test]
    fn duplicate_instance_keeps_console_attached() {
        let mut host = host(query_ok, set_rounds_to_5000);
        host.instances = 3;
        let detached = Request {
            detach_console: true,
            ..request(5_000)
        };
        let (result, _, _) = run(&host, &detached);
        assert!(result.is_err());
        assert!(!host.detached.get());
    }
    #[test]
    fn failed_query_never_reaches_set() {
        let host = host(query_fails, set_rounds_to_5000);
        let (result, stage, out) = run(&host, &request(5_000));
        let fatal = result.expect_err("query failure is fatal");
        assert_eq!(stage, Stage::Query);
        assert!(matches!(fatal.error, Error::Query(_)));
        assert_eq!(fatal.to_string(), "NtQueryTimerResolution failed (status 0xC0000001)");
        assert!(out.is_empty());
        assert_eq!(SET_CALLS.with(Cell::get), 0);
        assert!(!host.parked.get());
    }
    #[test]
    fn failed_set_reports_nothing() {
        let host = host(query_ok, set_fails);
        let (result, stage, out) = run(&host, &request(5_000));
        let fatal = result.expect_err("set failure is fatal");
        assert_eq!(stage, Stage::Set);
        assert!(fatal.to_string().starts_with("NtSetTimerResolution failed"));
        assert!(out.is_empty());
        assert!(!host.parked.get());
    }
    #[test]
    fn unloadable_library_fails_at_load() {
        let mut host = host(query_ok, set_rounds_to_5000);
        host.libraries.retain(|library| *library != "kernel32.dll");
        let (result, stage, _) = run(&host, &request(5_000));
        let fatal = result.expect_err("missing library is fatal");
        assert_eq!(stage, Stage::LoadLibs);
        assert_eq!(fatal.to_string(), "LoadLibrary failed: kernel32.dll");
        assert_eq!(QUERY_CALLS.with(Cell::get), 0);
    }
    #[test]
    fn missing_timer_export_fails_at_resolution() {
        let query: QueryTimerResolution = query_ok;
        let host = FakeHost::new().with_export("ntdll.dll", NT_QUERY_TIMER_RESOLUTION, query as *mut c_void);
        let (result, stage, _) = run(&host, &request(5_000));
        let fatal = result.expect_err("missing NtSetTimerResolution is fatal");
        assert_eq!(stage, Stage::ResolveSymbols);
        assert_eq!(fatal.to_string(), "NtSetTimerResolution could not be resolved");
        assert_eq!(QUERY_CALLS.with(Cell::get), 0);
    }
}
