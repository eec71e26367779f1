//! Fan-out policy for image-to-video jobs.
//!
//! A job whose image list exceeds the split threshold is partitioned into
//! contiguous chunks of as-equal-as-possible size, preserving submission
//! order, one chunk per worker. Every other operation runs on exactly one
//! worker with its payload untouched.

use serde_json::Value;

use render_common::job::Job;

/// How a job maps onto external workers.
pub struct DispatchPlan {
    pub workers_needed: u32,
    /// One payload per sub-request, in submission order.
    pub sub_payloads: Vec<Value>,
}

/// Compute the workers a job needs and the payload each receives.
pub fn plan_dispatch(job: &Job, threshold: usize, max_chunks: u32) -> DispatchPlan {
    if job.operation.is_splittable() && max_chunks > 1 {
        if let Some(images) = job.payload.get("images").and_then(Value::as_array) {
            if images.len() > threshold {
                return split_images(&job.payload, images, max_chunks);
            }
        }
    }
    DispatchPlan {
        workers_needed: 1,
        sub_payloads: vec![job.payload.clone()],
    }
}

fn split_images(payload: &Value, images: &[Value], max_chunks: u32) -> DispatchPlan {
    let total = images.len();
    let chunk_size = total.div_ceil(max_chunks as usize);
    let chunks = std::cmp::min(max_chunks as usize, total.div_ceil(chunk_size));

    // First `total % chunks` chunks carry one extra image, so sizes differ
    // by at most one.
    let base = total / chunks;
    let remainder = total % chunks;

    let mut sub_payloads = Vec::with_capacity(chunks);
    let mut offset = 0;
    for index in 0..chunks {
        let len = base + usize::from(index < remainder);
        let slice = &images[offset..offset + len];
        offset += len;

        let mut sub = payload.clone();
        if let Some(object) = sub.as_object_mut() {
            object.insert("images".to_owned(), Value::Array(slice.to_vec()));
        }
        sub_payloads.push(sub);
    }

    DispatchPlan {
        workers_needed: u32::try_from(chunks).unwrap_or(max_chunks),
        sub_payloads,
    }
}
