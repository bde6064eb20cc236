//! Instance kinds: how a node finds the provider instance backing it.

use ec2_agent_id::{InstanceId, SpotRequestId};
use serde::{Deserialize, Serialize};

/// The capacity model backing a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstanceKind {
    /// A directly launched instance.
    OnDemand {
        #[serde(default)]
        instance_id: Option<InstanceId>,
    },
    /// An instance fulfilled from a spot request. The instance id is unknown
    /// until the request is fulfilled.
    Spot {
        spot_request_id: SpotRequestId,
        #[serde(default)]
        instance_id: Option<InstanceId>,
    },
}

impl InstanceKind {
    pub fn on_demand(instance_id: InstanceId) -> Self {
        Self::OnDemand {
            instance_id: Some(instance_id),
        }
    }

    pub fn spot(spot_request_id: SpotRequestId) -> Self {
        Self::Spot {
            spot_request_id,
            instance_id: None,
        }
    }

    /// The provider instance currently backing the node, if known.
    pub fn resolve_current_instance_id(&self) -> Option<&InstanceId> {
        match self {
            Self::OnDemand { instance_id } | Self::Spot { instance_id, .. } => instance_id.as_ref(),
        }
    }

    /// Record the instance backing the node. Returns true if it changed.
    pub fn assign_instance_id(&mut self, id: InstanceId) -> bool {
        let slot = match self {
            Self::OnDemand { instance_id } | Self::Spot { instance_id, .. } => instance_id,
        };
        if slot.as_ref() == Some(&id) {
            return false;
        }
        *slot = Some(id);
        true
    }

    /// Display label of the capacity model.
    pub fn label(&self) -> &'static str {
        match self {
            Self::OnDemand { .. } => "On Demand",
            Self::Spot { .. } => "Spot",
        }
    }
}
