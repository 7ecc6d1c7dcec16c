pub const HUNDRED_NS_PER_MS: u32 = 10_000;
pub fn hundred_ns_to_ms(value: u32) -> f64 {
    f64::from(value) / f64::from(HUNDRED_NS_PER_MS)
}
