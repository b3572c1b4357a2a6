//! Registry of running VM images.

use crate::backend::Services;
use crate::error::{Result, WorkpoolError};
use crate::model::{DeleteMethod, VmImageModel, VmImageState};
use crate::vm_image::VmImageHandle;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

type ImageMap = Arc<RwLock<HashMap<String, VmImageHandle>>>;

#[derive(Clone)]
pub struct VmImageManager {
    services: Services,
    images: ImageMap,
}

impl VmImageManager {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            images: Arc::default(),
        }
    }

    /// Start an image task for every stored image. Returns how many were loaded.
    pub async fn initialize(&self) -> Result<usize> {
        let models = self.services.repository.find_all_vm_images().await?;
        let count = models.len();
        for model in models {
            self.start(model);
        }
        info!("Loaded {} VM images", count);
        Ok(count)
    }

    /// Store a new image and start working on it.
    pub async fn create(&self, model: VmImageModel) -> Result<VmImageHandle> {
        if model.name.trim().is_empty() {
            return Err(WorkpoolError::InvalidInput("A VM image needs a name.".to_string()));
        }
        if self
            .services
            .repository
            .find_vm_image_by_name(&model.name)
            .await?
            .is_some()
        {
            return Err(WorkpoolError::InvalidInput(
                "The given name is already in use.".to_string(),
            ));
        }

        self.services.repository.insert_vm_image(&model).await?;
        info!("Created VM image {} ({})", model.name, model.id);
        Ok(self.start(model))
    }

    pub fn get(&self, id: &str) -> Option<VmImageHandle> {
        self.images
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<VmImageHandle>> {
        let model = self.services.repository.find_vm_image_by_name(name).await?;
        Ok(model.and_then(|m| self.get(&m.id)))
    }

    /// Current models of all running images.
    pub async fn list(&self) -> Result<Vec<VmImageModel>> {
        let handles: Vec<VmImageHandle> = self
            .images
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut models = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.model().await {
                Ok(model) => models.push(model),
                Err(e) => debug!("Skipping image {}: {}", handle.id(), e),
            }
        }
        models.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(models)
    }

    pub async fn delete(&self, id: &str, method: DeleteMethod) -> Result<()> {
        let handle = self
            .get(id)
            .ok_or_else(|| WorkpoolError::NotFound(format!("VM image {}", id)))?;
        match method {
            DeleteMethod::DeleteFromDisk => handle.delete().await,
            DeleteMethod::RemoveFromInventory => handle.forget().await,
        }
    }

    fn start(&self, model: VmImageModel) -> VmImageHandle {
        let handle = VmImageHandle::spawn(model, self.services.clone());
        self.images
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id().to_string(), handle.clone());
        tokio::spawn(watch_until_deleted(self.images.clone(), handle.clone()));
        handle
    }
}

/// Drop the image from the registry once it reports `deleted` or stops.
async fn watch_until_deleted(images: ImageMap, handle: VmImageHandle) {
    match handle.subscribe().await {
        Ok(mut changes) => {
            while let Some(change) = changes.recv().await {
                if change.new == VmImageState::Deleted {
                    break;
                }
            }
        }
        Err(e) => warn!("Could not watch image {}: {}", handle.id(), e),
    }

    debug!("Removing image {} from the registry", handle.id());
    images
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(handle.id());
}
