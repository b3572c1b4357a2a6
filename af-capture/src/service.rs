//! Ticket registry through which clients start and steer captures.

use crate::error::{CaptureError, Result};
use crate::plan::{RequestFactory, TicketRequest};
use crate::process::ProcessMonitor;
use crate::request::{CaptureRequest, Project};
use crate::state::CaptureState;
use crate::status::{Status, StatusReport};
use af_workpool::{VcManager, WorkpoolError, WorkpoolManager};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info, info_span, Instrument};

struct Ticket {
    status: Status,
    project_id: i64,
}

#[derive(Clone)]
pub struct CaptureService {
    factory: Arc<RequestFactory>,
    workpools: WorkpoolManager,
    vc: Arc<dyn VcManager>,
    monitor: ProcessMonitor,
    tickets: Arc<Mutex<HashMap<u64, Ticket>>>,
    next_ticket: Arc<AtomicU64>,
}

impl CaptureService {
    pub fn new(
        factory: RequestFactory,
        workpools: WorkpoolManager,
        vc: Arc<dyn VcManager>,
        monitor: ProcessMonitor,
    ) -> Self {
        Self {
            factory: Arc::new(factory),
            workpools,
            vc,
            monitor,
            tickets: Arc::default(),
            next_ticket: Arc::new(AtomicU64::new(1)),
        }
    }

    fn tickets(&self) -> MutexGuard<'_, HashMap<u64, Ticket>> {
        self.tickets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a capture of `project` and return its ticket.
    pub async fn create(&self, request: TicketRequest, project: Arc<dyn Project>) -> Result<u64> {
        let workpool = self.workpools.get(&request.workpool_id).ok_or_else(|| {
            WorkpoolError::NotFound(format!("Workpool {}", request.workpool_id))
        })?;
        let project_id = project.id();
        let status = Status::new(self.factory.context().config.poll_interval());
        let capturer = self
            .factory
            .create_capturer(&request, project_id, status.clone())
            .await?;

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.tickets().insert(
            ticket,
            Ticket {
                status: status.clone(),
                project_id,
            },
        );

        let run = CaptureRequest::new(workpool, self.vc.clone(), project, capturer);
        let span = info_span!("capture", capture = project_id, ticket);
        tokio::spawn(
            async move {
                if let Err(e) = run.run().await {
                    error!("Capture ended with error: {}", e);
                }
            }
            .instrument(span),
        );
        info!("Created capture ticket {} for project {}", ticket, project_id);
        Ok(ticket)
    }

    pub fn status(&self, ticket: u64) -> Result<Status> {
        self.tickets()
            .get(&ticket)
            .map(|t| t.status.clone())
            .ok_or(CaptureError::UnknownTicket(ticket))
    }

    pub fn redeem(&self, ticket: u64) -> Result<StatusReport> {
        Ok(self.status(ticket)?.report())
    }

    /// Let a capture waiting on the user continue past `state`.
    pub fn next(&self, ticket: u64, state: CaptureState) -> Result<()> {
        let status = self.status(ticket)?;
        let done = state.next_done().ok_or(CaptureError::NotNextable(state))?;
        info!("Ticket {}: {} -> {}", ticket, state, done);
        status.set_current_state(done);
        Ok(())
    }

    /// Ask a capture to stop. Guest programs it is blocked on are killed; the
    /// run itself winds down and still releases its VM.
    pub fn cancel(&self, ticket: u64) -> Result<()> {
        let (status, project_id) = {
            let tickets = self.tickets();
            let entry = tickets
                .get(&ticket)
                .ok_or(CaptureError::UnknownTicket(ticket))?;
            (entry.status.clone(), entry.project_id)
        };
        if status.is_finished() {
            return Ok(());
        }
        info!("Cancelling ticket {}", ticket);
        status.set_current_state(CaptureState::Cancelling);
        if status.contains(CaptureState::VmAcquired) {
            self.monitor.cancel(project_id);
        }
        Ok(())
    }

    pub fn forget(&self, ticket: u64) -> Result<()> {
        self.tickets()
            .remove(&ticket)
            .map(|_| ())
            .ok_or(CaptureError::UnknownTicket(ticket))
    }

    pub fn tickets_in_flight(&self) -> Vec<u64> {
        let mut tickets: Vec<u64> = self
            .tickets()
            .iter()
            .filter(|(_, t)| !t.status.is_finished())
            .map(|(id, _)| *id)
            .collect();
        tickets.sort_unstable();
        tickets
    }
}
