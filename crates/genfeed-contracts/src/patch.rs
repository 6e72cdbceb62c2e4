use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::requests::{GeneratedImage, GenerationRequest, ImageStatus, RequestStatus};

/// Volatile request fields refreshed by a poll. `None` means "not in the payload".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPatch {
    pub id: u64,
    #[serde(default)]
    pub status: Option<RequestStatus>,
    #[serde(default)]
    pub estimated_completion_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub queue_position: Option<u64>,
    #[serde(default)]
    pub images: Vec<ImagePatch>,
}

/// Image fields addressed by content hash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePatch {
    pub hash: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub status: Option<ImageStatus>,
    #[serde(default)]
    pub available: Option<bool>,
    #[serde(default)]
    pub removed_for_safety: Option<bool>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl RequestPatch {
    /// Builds the patch a poll response carries for one request.
    ///
    /// Submission parameters, `created_at` and image order are never part of it.
    pub fn from_polled(request: &GenerationRequest) -> Self {
        Self {
            id: request.id,
            status: Some(request.status),
            estimated_completion_date: request.estimated_completion_date,
            queue_position: request.queue_position,
            images: request.images.iter().map(ImagePatch::from_polled).collect(),
        }
    }
}

impl ImagePatch {
    pub fn from_polled(image: &GeneratedImage) -> Self {
        Self {
            hash: image.hash.clone(),
            id: image.id,
            url: image.url.clone(),
            status: Some(image.status),
            available: Some(image.available),
            removed_for_safety: Some(image.removed_for_safety),
            seed: image.seed,
            width: image.width,
            height: image.height,
        }
    }

    pub fn from_signal(hash: impl Into<String>, status: ImageStatus) -> Self {
        Self {
            hash: hash.into(),
            status: Some(status),
            available: status.marks_available().then_some(true),
            removed_for_safety: (status == ImageStatus::RemovedForSafety).then_some(true),
            ..Self::default()
        }
    }
}

/// Merges `patch` into `request`. Returns whether anything changed.
///
/// A terminal request status is never replaced by a pollable one. Images in the patch
/// that the request does not own are ignored.
pub fn apply_request_patch(request: &mut GenerationRequest, patch: &RequestPatch) -> bool {
    if request.id != patch.id {
        return false;
    }
    let mut changed = false;

    if let Some(status) = patch.status {
        let downgrade = request.status.is_terminal() && !status.is_terminal();
        if !downgrade && request.status != status {
            request.status = status;
            changed = true;
        }
    }
    changed |= set_if_some(
        &mut request.estimated_completion_date,
        patch.estimated_completion_date,
    );
    changed |= set_if_some(&mut request.queue_position, patch.queue_position);

    for image_patch in &patch.images {
        if let Some(image) = request
            .images
            .iter_mut()
            .find(|image| image.hash == image_patch.hash)
        {
            changed |= apply_image_patch(image, image_patch);
        }
    }
    changed
}

/// Merges `patch` into `image`. Returns whether anything changed.
///
/// `available` and `removed_for_safety` only ever flip to true, and a terminal status
/// is never replaced by `Pending`/`Processing`.
pub fn apply_image_patch(image: &mut GeneratedImage, patch: &ImagePatch) -> bool {
    if image.hash != patch.hash {
        return false;
    }
    let mut changed = false;

    if let Some(status) = patch.status {
        let downgrade = image.status.is_terminal() && !status.is_terminal();
        if !downgrade && image.status != status {
            image.status = status;
            changed = true;
        }
    }

    let becomes_available =
        patch.available == Some(true) || image.status.marks_available();
    if becomes_available && !image.available {
        image.available = true;
        changed = true;
    }
    let removed = patch.removed_for_safety == Some(true)
        || image.status == ImageStatus::RemovedForSafety;
    if removed && !image.removed_for_safety {
        image.removed_for_safety = true;
        changed = true;
    }

    changed |= set_if_some(&mut image.id, patch.id);
    changed |= set_if_some(&mut image.url, patch.url.clone());
    changed |= set_if_some(&mut image.seed, patch.seed);
    changed |= set_if_some(&mut image.width, patch.width);
    changed |= set_if_some(&mut image.height, patch.height);
    changed
}

fn set_if_some<T: PartialEq>(slot: &mut Option<T>, value: Option<T>) -> bool {
    match value {
        Some(value) if slot.as_ref() != Some(&value) => {
            *slot = Some(value);
            true
        }
        _ => false,
    }
}
