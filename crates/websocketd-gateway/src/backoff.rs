//! Retry delays shared by the bus reconnect driver and the service-token
//! renewer: 1, 2, 4, 8, 16, then 32 seconds forever.

pub fn retry_delays() -> impl Iterator<Item = u64> {
    [1, 2, 4, 8, 16].into_iter().chain(std::iter::repeat(32))
}
