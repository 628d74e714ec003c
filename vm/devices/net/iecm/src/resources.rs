// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::virtchnl::VirtchnlChannel;
use iecm_defs::virtchnl2::QueueChunk;
use iecm_defs::virtchnl2::QueueVector;
use iecm_defs::virtchnl2::VectorChunk;

/// A list of control plane resources held by a vport.
///
/// The list is extended as setup progresses and must be released with
/// [`ResourceArena::destroy`], which undoes each step in reverse order.
///
/// If the arena is dropped without calling `destroy`, the resources leak on
/// the device.
#[derive(Default)]
pub struct ResourceArena {
    resources: Vec<Resource>,
}

#[derive(Debug)]
pub(crate) enum Resource {
    Vport(u32),
    Vectors(Vec<VectorChunk>),
    QueueVectorMaps {
        vport_id: u32,
        maps: Vec<QueueVector>,
    },
    EnabledQueues {
        vport_id: u32,
        chunks: Vec<QueueChunk>,
    },
    EnabledVport(u32),
}

impl ResourceArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the arena has no allocated resources.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub(crate) fn push(&mut self, resource: Resource) {
        self.resources.push(resource);
    }

    /// Releases every resource, newest first. Failures are logged and the
    /// remaining resources are still released.
    pub fn destroy(mut self, channel: &VirtchnlChannel) {
        for resource in self.resources.drain(..).rev() {
            let r = match &resource {
                Resource::Vport(vport_id) => channel.destroy_vport(*vport_id),
                Resource::Vectors(chunks) => channel.dealloc_vectors(chunks),
                Resource::QueueVectorMaps { vport_id, maps } => {
                    channel.unmap_queue_vector(*vport_id, maps).map(drop)
                }
                Resource::EnabledQueues { vport_id, chunks } => {
                    channel.disable_queues(*vport_id, chunks)
                }
                Resource::EnabledVport(vport_id) => channel.disable_vport(*vport_id),
            };
            if let Err(err) = r {
                tracing::error!(
                    ?resource,
                    error = &err as &dyn std::error::Error,
                    "failed to tear down resource"
                );
            }
        }
    }
}

impl Drop for ResourceArena {
    fn drop(&mut self) {
        if !self.resources.is_empty() {
            tracing::error!(count = self.resources.len(), "leaking resources");
        }
    }
}
