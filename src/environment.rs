use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::ResourceRequirements;
use crate::error::{BatchError, Result};

/// How the environment picks compute units when scaling out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationStrategy {
    /// Fewest, largest-capacity units first, minimizing launch count.
    BestFitProgressive,
    /// Smallest unit that still fits the widest pending requirement.
    BestFit,
    /// Capacity-optimized spot selection; largest units first here.
    SpotCapacityOptimized,
    /// Unit-size choice left to the underlying allocator.
    Optimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentState {
    Enabled,
    Disabled,
}

/// Opaque network placement handed through to the execution backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPlacement {
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    #[serde(default)]
    pub security_group_ids: Vec<String>,
}

/// A unit shape the environment may provision (the analogue of an instance
/// type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeUnitType {
    pub name: String,
    pub vcpus: u32,
    pub memory_mib: u64,
    #[serde(default)]
    pub gpus: u32,
}

impl ComputeUnitType {
    fn accommodates(&self, req: &ResourceRequirements) -> bool {
        f64::from(self.vcpus) >= req.vcpus
            && self.memory_mib >= req.memory_mib
            && self.gpus >= req.gpus
    }
}

/// A provisioned unit with live free-capacity counters. Units keep a
/// stable id; reservations reference units by id, never by position.
#[derive(Debug, Clone)]
struct ComputeUnit {
    id: u64,
    unit_type: usize,
    free_vcpus: f64,
    free_memory_mib: u64,
    free_gpus: u32,
}

impl ComputeUnit {
    fn new(id: u64, unit_type: usize, shape: &ComputeUnitType) -> Self {
        Self {
            id,
            unit_type,
            free_vcpus: f64::from(shape.vcpus),
            free_memory_mib: shape.memory_mib,
            free_gpus: shape.gpus,
        }
    }

    fn can_accommodate(&self, req: &ResourceRequirements) -> bool {
        self.free_vcpus >= req.vcpus
            && self.free_memory_mib >= req.memory_mib
            && self.free_gpus >= req.gpus
    }

    fn reserve(&mut self, req: &ResourceRequirements) {
        self.free_vcpus -= req.vcpus;
        self.free_memory_mib -= req.memory_mib;
        self.free_gpus -= req.gpus;
    }

    fn release(&mut self, req: &ResourceRequirements) {
        self.free_vcpus += req.vcpus;
        self.free_memory_mib += req.memory_mib;
        self.free_gpus += req.gpus;
    }

    fn idle(&self, shape: &ComputeUnitType) -> bool {
        self.free_vcpus >= f64::from(shape.vcpus)
            && self.free_memory_mib >= shape.memory_mib
            && self.free_gpus >= shape.gpus
    }
}

/// An elastic pool of execution capacity with bounded size and an allocation
/// policy.
///
/// Desired capacity is mutated only through [`set_desired_capacity`]
/// (the single capacity entry point); admission reserves capacity atomically
/// under the registry lock until the instance reaches a terminal state.
///
/// [`set_desired_capacity`]: ComputeEnvironment::set_desired_capacity
#[derive(Debug, Clone)]
pub struct ComputeEnvironment {
    pub name: String,
    pub strategy: AllocationStrategy,
    pub min_vcpus: u32,
    pub max_vcpus: u32,
    pub placement: NetworkPlacement,
    pub unit_types: Vec<ComputeUnitType>,
    state: EnvironmentState,
    desired_vcpus: u32,
    next_unit_id: u64,
    units: Vec<ComputeUnit>,
    reservations: HashMap<Uuid, (u64, ResourceRequirements)>,
}

impl ComputeEnvironment {
    pub fn new(
        name: impl Into<String>,
        strategy: AllocationStrategy,
        min_vcpus: u32,
        max_vcpus: u32,
        unit_types: Vec<ComputeUnitType>,
        placement: NetworkPlacement,
    ) -> Self {
        let mut env = Self {
            name: name.into(),
            strategy,
            min_vcpus,
            max_vcpus,
            placement,
            unit_types,
            state: EnvironmentState::Enabled,
            desired_vcpus: 0,
            next_unit_id: 0,
            units: Vec::new(),
            reservations: HashMap::new(),
        };
        // Baseline provisioning up to the floor.
        env.desired_vcpus = min_vcpus;
        env.rebalance_units(&[]);
        env
    }

    pub fn state(&self) -> EnvironmentState {
        self.state
    }

    /// Stop new admission. In-flight instances keep their reservations and
    /// run to completion.
    pub fn disable(&mut self) {
        self.state = EnvironmentState::Disabled;
        tracing::info!(environment = %self.name, "compute environment disabled");
    }

    pub fn enable(&mut self) {
        self.state = EnvironmentState::Enabled;
        tracing::info!(environment = %self.name, "compute environment enabled");
    }

    pub fn desired_vcpus(&self) -> u32 {
        self.desired_vcpus
    }

    /// Sum of vCPUs across currently provisioned units.
    pub fn provisioned_vcpus(&self) -> u32 {
        self.units
            .iter()
            .map(|u| self.unit_types[u.unit_type].vcpus)
            .sum()
    }

    pub fn free_vcpus(&self) -> f64 {
        self.units.iter().map(|u| u.free_vcpus).sum()
    }

    /// Whether `req` could ever be admitted, at max capacity with the most
    /// capable unit shape.
    pub fn can_ever_fit(&self, req: &ResourceRequirements) -> bool {
        req.vcpus <= f64::from(self.max_vcpus)
            && self.unit_types.iter().any(|t| t.accommodates(req))
    }

    /// Set desired capacity, clamped to `[min, max]` vCPUs.
    ///
    /// Fails with [`BatchError::CapacityRange`] if some pending requirement
    /// cannot be satisfied even at max capacity; the stored capacity is
    /// untouched in that case. Returns the clamped value actually stored.
    pub fn set_desired_capacity(
        &mut self,
        requested: u32,
        pending: &[ResourceRequirements],
    ) -> Result<u32> {
        if let Some(req) = pending.iter().find(|r| !self.can_ever_fit(r)) {
            return Err(BatchError::CapacityRange {
                requested,
                max: self.max_vcpus,
                vcpus: req.vcpus,
                memory_mib: req.memory_mib,
                gpus: req.gpus,
            });
        }

        let clamped = requested.clamp(self.min_vcpus, self.max_vcpus);
        if clamped != self.desired_vcpus {
            tracing::debug!(
                environment = %self.name,
                requested,
                desired = clamped,
                "desired capacity updated"
            );
        }
        self.desired_vcpus = clamped;
        self.rebalance_units(pending);
        Ok(clamped)
    }

    /// Reserve capacity for an instance. Returns `true` only if the
    /// environment is enabled and some provisioned unit has room for the
    /// whole requirement; the reservation is held until [`release`].
    ///
    /// [`release`]: ComputeEnvironment::release
    pub fn admit(&mut self, instance_id: Uuid, req: &ResourceRequirements) -> bool {
        if self.state == EnvironmentState::Disabled {
            return false;
        }
        if self.reservations.contains_key(&instance_id) {
            // Already holding capacity for this instance.
            return true;
        }

        // Tightest-fitting unit by free vCPUs keeps large units open for
        // large requirements.
        let candidate = self
            .units
            .iter()
            .filter(|u| u.can_accommodate(req))
            .min_by(|a, b| {
                a.free_vcpus
                    .partial_cmp(&b.free_vcpus)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|u| u.id);

        match candidate {
            Some(unit_id) => {
                if let Some(unit) = self.units.iter_mut().find(|u| u.id == unit_id) {
                    unit.reserve(req);
                }
                self.reservations.insert(instance_id, (unit_id, *req));
                true
            }
            None => false,
        }
    }

    /// Release the capacity held for `instance_id`, if any.
    pub fn release(&mut self, instance_id: Uuid) {
        if let Some((unit_id, req)) = self.reservations.remove(&instance_id) {
            if let Some(unit) = self.units.iter_mut().find(|u| u.id == unit_id) {
                unit.release(&req);
            }
        }
    }

    pub fn holds_reservation(&self, instance_id: Uuid) -> bool {
        self.reservations.contains_key(&instance_id)
    }

    /// Grow or shrink the provisioned unit set toward the desired capacity.
    ///
    /// Growth follows the allocation strategy; shrink removes only idle
    /// units, never evicting a reservation.
    fn rebalance_units(&mut self, pending: &[ResourceRequirements]) {
        if self.unit_types.is_empty() {
            return;
        }

        // Grow toward desired; the last unit may overshoot desired but the
        // total never exceeds max.
        while self.provisioned_vcpus() < self.desired_vcpus {
            let type_idx = self.pick_unit_type(pending);
            let shape = self.unit_types[type_idx].clone();
            if shape.vcpus == 0 || self.provisioned_vcpus() + shape.vcpus > self.max_vcpus {
                break;
            }
            let unit_id = self.next_unit_id;
            self.next_unit_id += 1;
            self.units.push(ComputeUnit::new(unit_id, type_idx, &shape));
        }

        // Shrink: drop idle units while doing so stays at or above desired.
        loop {
            let excess = self.provisioned_vcpus().saturating_sub(self.desired_vcpus);
            if excess == 0 {
                break;
            }
            let removable = self
                .units
                .iter()
                .filter(|u| u.idle(&self.unit_types[u.unit_type]))
                .filter(|u| self.unit_types[u.unit_type].vcpus <= excess)
                .map(|u| u.id)
                .next_back();
            match removable {
                Some(unit_id) => {
                    self.units.retain(|u| u.id != unit_id);
                }
                None => break,
            }
        }
    }

    fn pick_unit_type(&self, pending: &[ResourceRequirements]) -> usize {
        match self.strategy {
            AllocationStrategy::BestFitProgressive
            | AllocationStrategy::SpotCapacityOptimized
            | AllocationStrategy::Optimal => {
                // Fewest, largest units first.
                self.unit_types
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, t)| t.vcpus)
                    .map(|(idx, _)| idx)
                    .unwrap_or(0)
            }
            AllocationStrategy::BestFit => {
                // Smallest unit that still fits the widest pending
                // requirement; smallest overall when nothing is pending.
                let fits_all = |t: &ComputeUnitType| {
                    pending.iter().all(|r| t.accommodates(r))
                };
                self.unit_types
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| pending.is_empty() || fits_all(t))
                    .min_by_key(|(_, t)| t.vcpus)
                    .or_else(|| {
                        self.unit_types
                            .iter()
                            .enumerate()
                            .max_by_key(|(_, t)| t.vcpus)
                    })
                    .map(|(idx, _)| idx)
                    .unwrap_or(0)
            }
        }
    }
}

/// Owning registry of compute environments keyed by identifier. Queue
/// bindings reference environments by name, never by embedded handle.
#[derive(Debug, Default)]
pub struct EnvironmentRegistry {
    environments: HashMap<String, ComputeEnvironment>,
}

impl EnvironmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, environment: ComputeEnvironment) {
        self.environments
            .insert(environment.name.clone(), environment);
    }

    pub fn get(&self, name: &str) -> Option<&ComputeEnvironment> {
        self.environments.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ComputeEnvironment> {
        self.environments.get_mut(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.environments.keys().cloned().collect()
    }

    /// Release a reservation wherever it is held.
    pub fn release_everywhere(&mut self, instance_id: Uuid) {
        for env in self.environments.values_mut() {
            env.release(instance_id);
        }
    }
}
