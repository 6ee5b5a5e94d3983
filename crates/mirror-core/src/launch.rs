//! Launch geometry for grid-stride kernels
//!
//! A [`LaunchPlan`] pairs a group count with a group size. Kernels walk the
//! input with a grid-stride loop: thread `i` visits `i, i + S, i + 2S, ...`
//! where `S = group_count * threads_per_group`, which covers any `N` exactly
//! once no matter how `S` compares to `N`.
//!
//! # Policy
//!
//! ```text
//! N < max_concurrent * m  (small):  t = ceil(N / m) threads
//!                                   groups = ceil(t / g); one group shrinks to t threads
//! otherwise               (large):  groups = max_concurrent / g, g threads each
//! ```
//!
//! `m` (minimum elements per thread) and `g` (group size) come from a
//! [`LaunchPolicy`]; `g` is further capped by the device.
//!
//! # Example
//!
//! ```rust
//! use mirror_core::{compute_launch_plan, CapabilityDescriptor};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let capability = CapabilityDescriptor::new(2048, 6, 256);
//!
//! let plan = compute_launch_plan(&capability, 100)?;
//! assert_eq!((plan.group_count, plan.threads_per_group), (1, 4));
//!
//! let plan = compute_launch_plan(&capability, 10_000_000)?;
//! assert_eq!((plan.group_count, plan.threads_per_group), (48, 256));
//! plan.verify_coverage(10_000_000)?;
//! # Ok(())
//! # }
//! ```

use mirror_runtime::{
    AcceleratorRuntime, BlockDim, CapabilityDescriptor, ChannelId, DevicePtr, GridDim, MirrorError, Result,
    SimRuntime,
};
use std::fmt;

/// Below this many elements per thread, fewer and busier threads win
pub const DEFAULT_MIN_ELEMENTS_PER_THREAD: u32 = 32;

/// Group size used unless the device allows less
pub const DEFAULT_MAX_THREADS_PER_GROUP: u32 = 256;

/// Environment override for [`LaunchPolicy::min_elements_per_thread`]
pub const ENV_MIN_ELEMENTS_PER_THREAD: &str = "GPU_MIRROR_MIN_ELEMENTS_PER_THREAD";

/// Environment override for [`LaunchPolicy::max_threads_per_group`]
pub const ENV_MAX_THREADS_PER_GROUP: &str = "GPU_MIRROR_MAX_THREADS_PER_GROUP";

/// `ceil(a / b)`
///
/// # Errors
///
/// `InvalidArgument` if `b == 0`.
pub fn ceil_div(a: u64, b: u64) -> Result<u64> {
    if b == 0 {
        return Err(MirrorError::invalid_argument(format!("ceil_div({a}, 0)")));
    }
    Ok(a / b + u64::from(a % b != 0))
}

/// Tunable heuristics behind [`LaunchPolicy::plan`]
///
/// The defaults were tuned empirically for one GPU generation; other
/// architectures may prefer different values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaunchPolicy {
    /// Minimum profitable work per thread (`m`)
    pub min_elements_per_thread: u32,
    /// Preferred group size (`g`), capped by the device's limit
    pub max_threads_per_group: u32,
}

impl Default for LaunchPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_ELEMENTS_PER_THREAD, DEFAULT_MAX_THREADS_PER_GROUP)
    }
}

impl LaunchPolicy {
    pub const fn new(min_elements_per_thread: u32, max_threads_per_group: u32) -> Self {
        Self {
            min_elements_per_thread,
            max_threads_per_group,
        }
    }

    /// Defaults overridden by `GPU_MIRROR_MIN_ELEMENTS_PER_THREAD` and
    /// `GPU_MIRROR_MAX_THREADS_PER_GROUP`
    ///
    /// Unparsable or zero values are ignored with a warning.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            min_elements_per_thread: env_u32(ENV_MIN_ELEMENTS_PER_THREAD).unwrap_or(defaults.min_elements_per_thread),
            max_threads_per_group: env_u32(ENV_MAX_THREADS_PER_GROUP).unwrap_or(defaults.max_threads_per_group),
        }
    }

    /// Both heuristics must be positive
    pub fn validate(&self) -> Result<()> {
        if self.min_elements_per_thread == 0 {
            return Err(MirrorError::invalid_argument("min_elements_per_thread must be positive"));
        }
        if self.max_threads_per_group == 0 {
            return Err(MirrorError::invalid_argument("max_threads_per_group must be positive"));
        }
        Ok(())
    }

    /// Geometry for `n` elements on a device with `capability`
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `n == 0`, a capability field or policy value is
    /// zero, or the group count does not fit the launch primitive.
    pub fn plan(&self, capability: &CapabilityDescriptor, n: u64) -> Result<LaunchPlan> {
        if n == 0 {
            return Err(MirrorError::invalid_argument("cannot plan a launch over 0 elements"));
        }
        capability.validate()?;
        self.validate()?;

        let group_size = self.max_threads_per_group.min(capability.max_threads_per_group);
        let per_thread = u64::from(self.min_elements_per_thread);
        let max_concurrent = capability.max_concurrent_threads();

        let plan = if n < max_concurrent.saturating_mul(per_thread) {
            let threads = ceil_div(n, per_thread)?;
            let groups = ceil_div(threads, u64::from(group_size))?;
            if groups == 1 {
                // threads <= group_size here
                LaunchPlan::new(1, threads as u32)
            } else {
                LaunchPlan::new(group_count(groups)?, group_size)
            }
        } else {
            let groups = (max_concurrent / u64::from(group_size)).max(1);
            LaunchPlan::new(group_count(groups)?, group_size)
        };

        debug_assert!(plan.verify_coverage(n.min(1 << 20)).is_ok());
        tracing::debug!(
            elements = n,
            groups = plan.group_count,
            threads_per_group = plan.threads_per_group,
            "launch plan"
        );
        Ok(plan)
    }

    /// Look up device `index`, make it active, then plan for it
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an out-of-range device index, plus everything
    /// [`plan`](Self::plan) reports.
    pub fn plan_for_device(&self, runtime: &dyn AcceleratorRuntime, index: usize, n: u64) -> Result<LaunchPlan> {
        let capability = runtime.capability(index)?;
        runtime.set_active_device(index)?;
        self.plan(&capability, n)
    }
}

fn group_count(groups: u64) -> Result<u32> {
    u32::try_from(groups).map_err(|_| MirrorError::invalid_argument(format!("{groups} groups exceed the launch limit")))
}

fn env_u32(key: &str) -> Option<u32> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u32>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            tracing::warn!(key, value = %raw, "ignoring invalid launch policy override");
            None
        }
    }
}

/// [`LaunchPolicy::plan`] with the default policy
pub fn compute_launch_plan(capability: &CapabilityDescriptor, n: u64) -> Result<LaunchPlan> {
    LaunchPolicy::default().plan(capability, n)
}

/// [`LaunchPolicy::plan_for_device`] with the default policy
pub fn plan_for_device(runtime: &dyn AcceleratorRuntime, index: usize, n: u64) -> Result<LaunchPlan> {
    LaunchPolicy::default().plan_for_device(runtime, index, n)
}

/// Number of groups and threads per group for one kernel launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaunchPlan {
    pub group_count: u32,
    pub threads_per_group: u32,
}

impl LaunchPlan {
    pub const fn new(group_count: u32, threads_per_group: u32) -> Self {
        Self {
            group_count,
            threads_per_group,
        }
    }

    /// Total threads, the step of the grid-stride loop
    pub const fn stride(&self) -> u64 {
        self.group_count as u64 * self.threads_per_group as u64
    }

    /// Loop iterations thread `thread` performs over `n` elements
    pub fn iterations(&self, thread: u64, n: u64) -> u64 {
        let stride = self.stride();
        if stride == 0 || thread >= stride || thread >= n {
            return 0;
        }
        (n - 1 - thread) / stride + 1
    }

    /// Indices thread `thread` visits over `n` elements
    pub fn indices(&self, thread: u64, n: u64) -> StridedIndices {
        let stride = self.stride();
        let next = if stride == 0 || thread >= stride { n } else { thread };
        StridedIndices { next, end: n, stride }
    }

    /// Check that the plan visits each of `n` elements exactly once
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for a plan with zero groups or zero threads
    /// - `InvalidState` if the iteration counts do not add up to `n`
    pub fn verify_coverage(&self, n: u64) -> Result<()> {
        if self.stride() == 0 {
            return Err(MirrorError::invalid_argument(format!("degenerate launch plan {self}")));
        }
        let active = self.stride().min(n);
        let covered: u64 = (0..active).map(|thread| self.iterations(thread, n)).sum();
        if covered != n {
            return Err(MirrorError::invalid_state(format!(
                "{self} covers {covered} of {n} elements"
            )));
        }
        Ok(())
    }

    pub const fn grid(&self) -> GridDim {
        GridDim::linear(self.group_count)
    }

    pub const fn block(&self) -> BlockDim {
        BlockDim::linear(self.threads_per_group)
    }

    /// Enqueue a grid-stride kernel on the simulated runtime
    ///
    /// `body` runs once per element index in `[0, n)` with the bytes of `target`.
    pub fn launch_strided<F>(
        &self,
        runtime: &SimRuntime,
        name: &str,
        n: u64,
        channel: ChannelId,
        target: DevicePtr,
        mut body: F,
    ) -> Result<()>
    where
        F: FnMut(u64, &mut [u8]) + Send + 'static,
    {
        let plan = *self;
        runtime.launch(name, self.grid(), self.block(), channel, target, move |ctx, bytes| {
            for index in plan.indices(ctx.linear_global_id(), n) {
                body(index, bytes);
            }
        })?;
        mirror_tracing::performance::record_launch(name, self.group_count, self.threads_per_group, n);
        Ok(())
    }
}

impl fmt::Display for LaunchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} groups x {} threads ({} total)",
            self.group_count,
            self.threads_per_group,
            self.stride()
        )
    }
}

/// Strided index sequence of one thread (see [`LaunchPlan::indices`])
#[derive(Debug, Clone)]
pub struct StridedIndices {
    next: u64,
    end: u64,
    stride: u64,
}

impl Iterator for StridedIndices {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.next >= self.end {
            return None;
        }
        let index = self.next;
        self.next = self.next.saturating_add(self.stride);
        Some(index)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.next >= self.end {
            0
        } else {
            ((self.end - 1 - self.next) / self.stride + 1) as usize
        };
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for StridedIndices {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serial_test::serial;

    fn scenario_capability() -> CapabilityDescriptor {
        CapabilityDescriptor::new(2048, 6, 256)
    }

    #[test]
    fn test_ceil_div() {
        assert_eq!(ceil_div(100, 32).unwrap(), 4);
        assert_eq!(ceil_div(96, 32).unwrap(), 3);
        assert_eq!(ceil_div(0, 7).unwrap(), 0);
        assert_eq!(ceil_div(u64::MAX, 2).unwrap(), u64::MAX / 2 + 1);
        assert!(matches!(ceil_div(1, 0), Err(MirrorError::InvalidArgument(_))));
    }

    #[test]
    fn test_small_workload_single_group() {
        let plan = compute_launch_plan(&scenario_capability(), 100).unwrap();
        assert_eq!(plan, LaunchPlan::new(1, 4));
    }

    #[test]
    fn test_large_workload_saturates_device() {
        let plan = compute_launch_plan(&scenario_capability(), 10_000_000).unwrap();
        assert_eq!(plan, LaunchPlan::new(48, 256));
        plan.verify_coverage(10_000_000).unwrap();
    }

    #[test]
    fn test_small_workload_multiple_groups() {
        // 32 * 1000 elements -> 1000 threads -> 4 full groups
        let plan = compute_launch_plan(&scenario_capability(), 32_000).unwrap();
        assert_eq!(plan, LaunchPlan::new(4, 256));
    }

    #[test]
    fn test_branch_boundary() {
        let cap = scenario_capability();
        let threshold = cap.max_concurrent_threads() * 32;
        assert_eq!(compute_launch_plan(&cap, threshold - 1).unwrap(), LaunchPlan::new(48, 256));
        assert_eq!(compute_launch_plan(&cap, threshold).unwrap(), LaunchPlan::new(48, 256));
        assert_eq!(compute_launch_plan(&cap, 1).unwrap(), LaunchPlan::new(1, 1));
    }

    #[test]
    fn test_rejects_zero_elements_and_bad_capability() {
        assert!(matches!(
            compute_launch_plan(&scenario_capability(), 0),
            Err(MirrorError::InvalidArgument(_))
        ));
        for cap in [
            CapabilityDescriptor::new(0, 6, 256),
            CapabilityDescriptor::new(2048, 0, 256),
            CapabilityDescriptor::new(2048, 6, 0),
        ] {
            assert!(matches!(compute_launch_plan(&cap, 10), Err(MirrorError::InvalidArgument(_))));
        }
        let policy = LaunchPolicy::new(0, 256);
        assert!(policy.plan(&scenario_capability(), 10).is_err());
    }

    #[test]
    fn test_group_size_capped_by_device() {
        let cap = CapabilityDescriptor::new(1024, 2, 64);
        let plan = compute_launch_plan(&cap, 1_000_000).unwrap();
        assert_eq!(plan, LaunchPlan::new(32, 64));
    }

    #[test]
    fn test_large_branch_never_zero_groups() {
        // Fewer concurrent threads than one preferred group.
        let cap = CapabilityDescriptor::new(16, 2, 1024);
        let plan = compute_launch_plan(&cap, 1_000_000).unwrap();
        assert_eq!(plan, LaunchPlan::new(1, 256));
        plan.verify_coverage(1_000_000).unwrap();
    }

    #[test]
    fn test_custom_policy() {
        let policy = LaunchPolicy::new(8, 128);
        let plan = policy.plan(&scenario_capability(), 100).unwrap();
        assert_eq!(plan, LaunchPlan::new(1, 13));
    }

    #[test]
    fn test_plan_for_device() {
        let fast = CapabilityDescriptor::new(2048, 80, 1024);
        let runtime = SimRuntime::with_devices(vec![
            mirror_runtime::DeviceInfo::new("small", scenario_capability(), false),
            mirror_runtime::DeviceInfo::new("big", fast, false),
        ]);
        let plan = plan_for_device(&runtime, 1, 100_000_000).unwrap();
        assert_eq!(plan, LaunchPlan::new(640, 256));
        assert_eq!(runtime.active_device(), 1);

        assert!(matches!(
            plan_for_device(&runtime, 2, 100),
            Err(MirrorError::InvalidArgument(_))
        ));
        assert_eq!(runtime.active_device(), 1);
    }

    #[test]
    fn test_indices_and_iterations() {
        let plan = LaunchPlan::new(2, 2);
        assert_eq!(plan.indices(1, 10).collect::<Vec<_>>(), vec![1, 5, 9]);
        assert_eq!(plan.iterations(1, 10), 3);
        assert_eq!(plan.indices(3, 10).len(), 2);
        // Threads past N or outside the launch do nothing.
        assert_eq!(plan.indices(3, 2).count(), 0);
        assert_eq!(plan.iterations(3, 2), 0);
        assert_eq!(plan.indices(4, 100).count(), 0);
    }

    #[test]
    fn test_verify_coverage_rejects_degenerate_plan() {
        assert!(LaunchPlan::new(0, 256).verify_coverage(10).is_err());
        assert!(LaunchPlan::new(1, 0).verify_coverage(10).is_err());
    }

    #[test]
    fn test_display_and_dims() {
        let plan = LaunchPlan::new(48, 256);
        assert_eq!(plan.to_string(), "48 groups x 256 threads (12288 total)");
        assert_eq!(plan.grid(), GridDim::linear(48));
        assert_eq!(plan.block(), BlockDim::linear(256));
    }

    #[test]
    fn test_launch_strided_visits_every_index_once() {
        let runtime = SimRuntime::new();
        let n = 1000u64;
        let device = runtime.alloc_device(n as usize).unwrap();
        let plan = compute_launch_plan(&scenario_capability(), n).unwrap();

        plan.launch_strided(&runtime, "count", n, ChannelId::DEFAULT, device, |index, bytes| {
            bytes[index as usize] += 1;
        })
        .unwrap();
        runtime.synchronize(ChannelId::DEFAULT).unwrap();

        assert_eq!(runtime.device_bytes(device).unwrap(), vec![1u8; n as usize]);
        runtime.free_device(device).unwrap();
    }

    #[test]
    #[serial]
    fn test_policy_from_env() {
        std::env::set_var(ENV_MIN_ELEMENTS_PER_THREAD, "64");
        std::env::set_var(ENV_MAX_THREADS_PER_GROUP, "not-a-number");
        let policy = LaunchPolicy::from_env();
        assert_eq!(policy, LaunchPolicy::new(64, DEFAULT_MAX_THREADS_PER_GROUP));

        std::env::set_var(ENV_MAX_THREADS_PER_GROUP, "0");
        assert_eq!(LaunchPolicy::from_env().max_threads_per_group, DEFAULT_MAX_THREADS_PER_GROUP);

        std::env::remove_var(ENV_MIN_ELEMENTS_PER_THREAD);
        std::env::remove_var(ENV_MAX_THREADS_PER_GROUP);
        assert_eq!(LaunchPolicy::from_env(), LaunchPolicy::default());
    }

    fn capability_strategy() -> impl Strategy<Value = CapabilityDescriptor> {
        (1u32..=4096, 1u32..=128, 1u32..=1024).prop_map(|(per_unit, units, group)| {
            CapabilityDescriptor::new(per_unit, units, group)
        })
    }

    proptest! {
        #[test]
        fn prop_plan_covers_every_element(cap in capability_strategy(), n in 1u64..200_000) {
            let plan = compute_launch_plan(&cap, n).unwrap();
            prop_assert!(plan.group_count >= 1);
            prop_assert!(plan.threads_per_group >= 1);
            prop_assert!(plan.threads_per_group <= cap.max_threads_per_group);
            prop_assert!(plan.verify_coverage(n).is_ok());
        }

        #[test]
        fn prop_no_thread_reaches_past_n(
            groups in 1u32..64,
            threads in 1u32..512,
            n in 1u64..50_000,
            thread in 0u64..40_000,
        ) {
            let plan = LaunchPlan::new(groups, threads);
            let visited: Vec<u64> = plan.indices(thread, n).collect();
            prop_assert!(visited.iter().all(|&i| i < n));
            prop_assert_eq!(visited.len() as u64, plan.iterations(thread, n));
            if thread >= n {
                prop_assert!(visited.is_empty());
            }
        }

        #[test]
        fn prop_iterations_match_closed_form(groups in 1u32..32, threads in 1u32..256, n in 1u64..100_000) {
            let plan = LaunchPlan::new(groups, threads);
            let stride = plan.stride();
            let total: u64 = (0..stride)
                .map(|i| if n > i { (n - 1 - i) / stride + 1 } else { 0 })
                .sum();
            prop_assert_eq!(total, n);
        }
    }
}
