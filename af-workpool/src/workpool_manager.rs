//! Registry of running workpools.

use crate::backend::Services;
use crate::error::{Result, WorkpoolError};
use crate::instancer::{CloneInstancer, InstallInstancer, Instancer, NullInstancer};
use crate::model::{DeleteMethod, WorkpoolKind, WorkpoolModel, WorkpoolState};
use crate::vm_image_manager::VmImageManager;
use crate::workpool::WorkpoolHandle;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, info, warn};

type WorkpoolMap = Arc<RwLock<HashMap<String, WorkpoolHandle>>>;

#[derive(Clone)]
pub struct WorkpoolManager {
    services: Services,
    images: VmImageManager,
    workpools: WorkpoolMap,
}

impl WorkpoolManager {
    pub fn new(services: Services, images: VmImageManager) -> Self {
        Self {
            services,
            images,
            workpools: Arc::default(),
        }
    }

    /// Start every stored workpool. Images must be initialized first so clone
    /// pools can find theirs. A pool whose instancer cannot be built is logged
    /// and skipped.
    pub async fn initialize(&self) -> Result<usize> {
        let models = self.services.repository.find_all_workpools().await?;
        let mut started = 0;
        for model in models {
            let name = model.name.clone();
            match self.start(model).await {
                Ok(_) => started += 1,
                Err(e) => error!("Could not start workpool {}: {}", name, e),
            }
        }
        info!("Loaded {} workpools", started);
        Ok(started)
    }

    /// Store a new workpool and start it.
    pub async fn create(&self, model: WorkpoolModel) -> Result<WorkpoolHandle> {
        if model.name.trim().is_empty() {
            return Err(WorkpoolError::InvalidInput("A workpool needs a name.".to_string()));
        }
        if model.maximum_instances < 0 {
            return Err(WorkpoolError::InvalidInput(
                "Workpool size cannot be less than zero.".to_string(),
            ));
        }
        if self
            .services
            .repository
            .find_workpool_by_name(&model.name)
            .await?
            .is_some()
        {
            return Err(WorkpoolError::InvalidInput(
                "The given name is already in use.".to_string(),
            ));
        }

        let instancer = self.build_instancer(&model.kind).await?;
        self.services.repository.insert_workpool(&model).await?;
        info!("Created workpool {} ({})", model.name, model.id);
        Ok(self.register(model, instancer))
    }

    pub fn get(&self, id: &str) -> Option<WorkpoolHandle> {
        self.workpools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<WorkpoolHandle>> {
        let model = self.services.repository.find_workpool_by_name(name).await?;
        Ok(model.and_then(|m| self.get(&m.id)))
    }

    fn handles(&self) -> Vec<WorkpoolHandle> {
        self.workpools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Current models of all running workpools.
    pub async fn list(&self) -> Result<Vec<WorkpoolModel>> {
        let mut models = Vec::new();
        for handle in self.handles() {
            match handle.model().await {
                Ok(model) => models.push(model),
                Err(e) => debug!("Skipping workpool {}: {}", handle.id(), e),
            }
        }
        models.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(models)
    }

    pub async fn delete(&self, id: &str, method: DeleteMethod) -> Result<()> {
        let handle = self
            .get(id)
            .ok_or_else(|| WorkpoolError::NotFound(format!("workpool {}", id)))?;
        match method {
            DeleteMethod::DeleteFromDisk => handle.delete().await,
            DeleteMethod::RemoveFromInventory => handle.forget().await,
        }
    }

    /// Reset every available workpool. Pools in other states are left alone.
    pub async fn reset(&self) -> Result<()> {
        for handle in self.handles() {
            let state = handle.model().await?.state;
            if state != WorkpoolState::Available {
                debug!("Not resetting workpool {} while {}", handle.id(), state);
                continue;
            }
            handle.reset().await?;
        }
        Ok(())
    }

    async fn build_instancer(&self, kind: &WorkpoolKind) -> Result<Arc<dyn Instancer>> {
        Ok(match kind {
            WorkpoolKind::Clone { vm_image_id } => {
                let image = self
                    .images
                    .get(vm_image_id)
                    .ok_or_else(|| WorkpoolError::NotFound(format!("VM image {}", vm_image_id)))?;
                Arc::new(CloneInstancer::start(image, self.services.clone()).await?)
            }
            WorkpoolKind::Install { pattern } => {
                Arc::new(InstallInstancer::new(pattern.clone(), self.services.clone()))
            }
            WorkpoolKind::Custom => Arc::new(NullInstancer::new()),
        })
    }

    async fn start(&self, model: WorkpoolModel) -> Result<WorkpoolHandle> {
        let instancer = self.build_instancer(&model.kind).await?;
        Ok(self.register(model, instancer))
    }

    fn register(&self, model: WorkpoolModel, instancer: Arc<dyn Instancer>) -> WorkpoolHandle {
        let handle = WorkpoolHandle::spawn(model, instancer, self.services.clone());
        self.workpools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id().to_string(), handle.clone());
        tokio::spawn(watch_until_deleted(self.workpools.clone(), handle.clone()));
        handle
    }
}

/// Drop the workpool from the registry once it reports `deleted` or stops.
async fn watch_until_deleted(workpools: WorkpoolMap, handle: WorkpoolHandle) {
    match handle.subscribe().await {
        Ok(mut changes) => {
            while let Some(change) = changes.recv().await {
                if change.new == WorkpoolState::Deleted {
                    break;
                }
            }
        }
        Err(e) => warn!("Could not watch workpool {}: {}", handle.id(), e),
    }

    debug!("Removing workpool {} from the registry", handle.id());
    workpools
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(handle.id());
}
