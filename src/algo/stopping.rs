//! MDA stopping rule.
//!
//! Assuming a load balancer splits uniformly across n+1 next-hops when only
//! n have been seen, the chance that k fresh flows all land on the known
//! ones is (n/(n+1))^k. The threshold is the smallest k pushing that chance
//! below alpha/(n+1), which bounds the probability of ever missing a
//! next-hop by alpha across the growing hypothesis sequence.

/// Minimum number of distinct flows that must all map to the n known
/// next-hops before probing an interface stops.
pub fn stopping_threshold(n: usize, alpha: f64) -> usize {
    if n == 0 {
        // Nothing observed yet; one probe starts the enumeration
        return 1;
    }
    let n = n as f64;
    let k = ((alpha / (n + 1.0)).ln() / (n / (n + 1.0)).ln()).ceil();
    k as usize
}
