use super::{
    Error, Result, STATUS_SUCCESS,
    capabilities::{QueryTimerResolution, SetTimerResolution},
};
use crate::numeric::hundred_ns_to_ms;
/// Kernel timer resolution bounds in 100-ns units. Note that the kernel's
/// `minimum` is the coarsest period and `maximum` the finest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResolutionTriple {
    pub minimum: u32,
    pub maximum: u32,
    pub current: u32,
}
pub struct NtTimer {
    query: QueryTimerResolution,
    set: SetTimerResolution,
}
impl NtTimer {
    pub fn new(query: QueryTimerResolution, set: SetTimerResolution) -> Self {
        Self { query, set }
    }
    pub fn query(&self) -> Result<ResolutionTriple> {
        let mut triple = ResolutionTriple::default();
        let status = unsafe {
            (self.query)(
                &mut triple.minimum,
                &mut triple.maximum,
                &mut triple.current,
            )
        };
        if status != STATUS_SUCCESS {
            return Err(Error::Query(status));
        }
        Ok(triple)
    }
    /// Requests `desired` and stores the resolution the kernel actually
    /// applied in `triple.current`.
    pub fn set(&self, desired: u32, triple: &mut ResolutionTriple) -> Result<u32> {
        let mut current = triple.current;
        let status = unsafe { (self.set)(desired, u8::from(true), &mut current) };
        if status != STATUS_SUCCESS {
            return Err(Error::Set(status));
        }
        triple.current = current;
        Ok(current)
    }
}
pub fn format_report(current: u32) -> String {
    format!("Resolution set to: {:.12}ms", hundred_ns_to_ms(current))
}
