//! Extension manager
//!
//! Owns one listener pair per extension (visitor port + resident port) and
//! keeps that set in sync with the directory at runtime: startup load with
//! snapshot fallback, change notifications, and on-demand refresh. Stopping
//! a pair only kills its accept loops; legs already in flight run to
//! completion on their own tasks.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;

use intercom_core::TurnRole;
use intercom_directory::{
    ChangeAction, DirectoryChange, DirectoryStore, DirectoryWatcher, ExtensionRecord,
    SnapshotStore,
};

use crate::leg::{run_leg, LegDeps};
use crate::ServerError;

/// Socket receive buffer for audio listeners
const SOCKET_RECV_BUFFER: u32 = 1024 * 1024;

/// Accept backlog per listener
const LISTEN_BACKLOG: u32 = 100;

/// How many ports forward to scan when the configured one is taken
const PORT_SCAN_RANGE: u16 = 100;

struct PairState {
    record: ExtensionRecord,
    visitor_port: u16,
    resident_port: u16,
    visitor_task: JoinHandle<()>,
    resident_task: JoinHandle<()>,
}

/// Status row for the management API
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExtensionStatus {
    pub id: i64,
    pub ia_number: String,
    pub return_number: String,
    pub bind_ip: String,
    pub visitor_port: u16,
    pub resident_port: u16,
    pub building_id: i64,
}

/// Runtime-reconfigurable set of listener pairs
#[derive(Clone)]
pub struct ExtensionManager {
    deps: LegDeps,
    directory: Arc<dyn DirectoryStore>,
    snapshot: Arc<SnapshotStore>,
    pairs: Arc<Mutex<HashMap<i64, PairState>>>,
}

impl ExtensionManager {
    pub fn new(deps: LegDeps, snapshot: SnapshotStore) -> Self {
        let directory = deps.directory.clone();
        Self {
            deps,
            directory,
            snapshot: Arc::new(snapshot),
            pairs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Load the extension set (directory, then snapshot, then the default
    /// compatibility pair) and bind every pair. Binding runs in parallel
    /// per extension. Returns the number of pairs serving.
    pub async fn start_all(&self) -> usize {
        let records = match self.directory.list_extensions().await {
            Ok(records) if !records.is_empty() => {
                if let Err(err) = self.snapshot.save(&records).await {
                    tracing::warn!(%err, "could not mirror directory snapshot");
                }
                records
            }
            Ok(_) => {
                tracing::warn!("directory returned no extensions, trying snapshot");
                self.fallback_records().await
            }
            Err(err) => {
                tracing::warn!(%err, "directory unavailable at startup, trying snapshot");
                self.fallback_records().await
            }
        };

        let mut handles = Vec::with_capacity(records.len());
        for record in records {
            let manager = self.clone();
            handles.push(tokio::spawn(async move {
                let id = record.id;
                match manager.start_pair(record).await {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::error!(extension = id, %err, "failed to start listener pair");
                        false
                    }
                }
            }));
        }

        let mut started = 0;
        for handle in handles {
            if matches!(handle.await, Ok(true)) {
                started += 1;
            }
        }
        tracing::info!(started, "extension listeners serving");
        started
    }

    async fn fallback_records(&self) -> Vec<ExtensionRecord> {
        match self.snapshot.load().await {
            Ok(records) if !records.is_empty() => {
                tracing::info!(count = records.len(), "loaded extensions from snapshot");
                records
            }
            Ok(_) | Err(_) => {
                let directory = &self.deps.settings.directory;
                tracing::warn!(
                    ia_port = directory.default_ia_port,
                    return_port = directory.default_return_port,
                    "no extension source available, starting default pair"
                );
                vec![ExtensionRecord {
                    id: 0,
                    ia_number: "1000".to_string(),
                    return_number: "1001".to_string(),
                    bind_ip: directory.default_bind_ip.clone(),
                    ia_port: directory.default_ia_port,
                    return_port: directory.default_return_port,
                    building_id: 0,
                }]
            }
        }
    }

    /// Bind and serve one extension's listener pair
    pub async fn start_pair(&self, record: ExtensionRecord) -> Result<(), ServerError> {
        if self.pairs.lock().contains_key(&record.id) {
            return Err(ServerError::InvalidRequest(format!(
                "extension {} is already running",
                record.id
            )));
        }

        let (visitor_listener, visitor_port) =
            bind_with_scan(&record.bind_ip, record.ia_port).await?;
        let (resident_listener, resident_port) =
            bind_with_scan(&record.bind_ip, record.return_port).await?;

        if visitor_port != record.ia_port || resident_port != record.return_port {
            tracing::warn!(
                extension = record.id,
                requested = record.ia_port,
                visitor_port,
                resident_port,
                "port conflict, bound substitute ports"
            );
        }

        let visitor_task = tokio::spawn(accept_loop(
            visitor_listener,
            TurnRole::Visitor,
            self.deps.clone(),
            visitor_port,
        ));
        let resident_task = tokio::spawn(accept_loop(
            resident_listener,
            TurnRole::Resident,
            self.deps.clone(),
            resident_port,
        ));

        tracing::info!(
            extension = record.id,
            ia_number = %record.ia_number,
            visitor_port,
            resident_port,
            "listener pair started"
        );

        self.pairs.lock().insert(
            record.id,
            PairState {
                record,
                visitor_port,
                resident_port,
                visitor_task,
                resident_task,
            },
        );
        Ok(())
    }

    /// Stop one pair's accept loops. In-flight sessions keep running.
    pub fn stop_pair(&self, id: i64) -> bool {
        match self.pairs.lock().remove(&id) {
            Some(pair) => {
                pair.visitor_task.abort();
                pair.resident_task.abort();
                tracing::info!(extension = id, "listener pair stopped");
                true
            }
            None => {
                tracing::warn!(extension = id, "stop requested for unknown extension");
                false
            }
        }
    }

    /// React to one directory change notification
    pub async fn apply_change(&self, change: DirectoryChange) {
        let id = change.record.id;
        match change.action {
            ChangeAction::Insert => {
                if let Err(err) = self.start_pair(change.record).await {
                    tracing::error!(extension = id, %err, "insert: listener pair not started");
                }
            }
            ChangeAction::Update => {
                self.stop_pair(id);
                if let Err(err) = self.start_pair(change.record).await {
                    tracing::error!(extension = id, %err, "update: listener pair not restarted");
                }
            }
            ChangeAction::Delete => {
                self.stop_pair(id);
            }
        }
        self.mirror_snapshot().await;
    }

    /// Reconcile the running set against the directory. Returns
    /// (removed, updated, added).
    pub async fn refresh(&self) -> Result<(usize, usize, usize), ServerError> {
        let desired = self.directory.list_extensions().await?;
        if let Err(err) = self.snapshot.save(&desired).await {
            tracing::warn!(%err, "could not mirror directory snapshot");
        }

        let current: HashMap<i64, ExtensionRecord> = self
            .pairs
            .lock()
            .iter()
            .map(|(id, pair)| (*id, pair.record.clone()))
            .collect();
        let desired_ids: HashMap<i64, &ExtensionRecord> =
            desired.iter().map(|r| (r.id, r)).collect();

        let mut removed = 0;
        for id in current.keys() {
            if !desired_ids.contains_key(id) && self.stop_pair(*id) {
                removed += 1;
            }
        }

        let mut updated = 0;
        let mut added = 0;
        for record in desired {
            match current.get(&record.id) {
                Some(existing) if existing.requires_restart(&record) => {
                    self.stop_pair(record.id);
                    match self.start_pair(record).await {
                        Ok(()) => updated += 1,
                        Err(err) => tracing::error!(%err, "refresh: pair not restarted"),
                    }
                }
                Some(_) => {}
                None => match self.start_pair(record).await {
                    Ok(()) => added += 1,
                    Err(err) => tracing::error!(%err, "refresh: pair not started"),
                },
            }
        }

        tracing::info!(removed, updated, added, "extension refresh complete");
        Ok((removed, updated, added))
    }

    /// Restart one pair with its current configuration
    pub async fn restart(&self, id: i64) -> Result<bool, ServerError> {
        let record = match self.pairs.lock().get(&id) {
            Some(pair) => pair.record.clone(),
            None => return Ok(false),
        };
        self.stop_pair(id);
        self.start_pair(record).await?;
        Ok(true)
    }

    /// Resolve an extension number ("ramal") to its id
    pub fn id_for_number(&self, number: &str) -> Option<i64> {
        self.pairs
            .lock()
            .values()
            .find(|pair| pair.record.ia_number == number)
            .map(|pair| pair.record.id)
    }

    /// Resolve which pair serves a port, visitor or resident side
    pub fn pair_for_port(&self, port: u16) -> Option<ExtensionStatus> {
        self.pairs
            .lock()
            .values()
            .find(|pair| pair.visitor_port == port || pair.resident_port == port)
            .map(status_row)
    }

    pub fn status(&self) -> Vec<ExtensionStatus> {
        self.pairs.lock().values().map(status_row).collect()
    }

    pub fn active_pairs(&self) -> usize {
        self.pairs.lock().len()
    }

    async fn mirror_snapshot(&self) {
        let records: Vec<ExtensionRecord> = self
            .pairs
            .lock()
            .values()
            .map(|pair| pair.record.clone())
            .collect();
        if let Err(err) = self.snapshot.save(&records).await {
            tracing::warn!(%err, "could not mirror snapshot after change");
        }
    }

    /// Long-lived worker consuming directory change notifications
    pub fn spawn_watcher(
        &self,
        mut watcher: Box<dyn DirectoryWatcher>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                match watcher.next_change().await {
                    Ok(change) => {
                        tracing::info!(
                            action = ?change.action,
                            extension = change.record.id,
                            "directory change received"
                        );
                        manager.apply_change(change).await;
                    }
                    Err(err) => {
                        tracing::error!(%err, "directory watcher terminated");
                        break;
                    }
                }
            }
        })
    }
}

fn status_row(pair: &PairState) -> ExtensionStatus {
    ExtensionStatus {
        id: pair.record.id,
        ia_number: pair.record.ia_number.clone(),
        return_number: pair.record.return_number.clone(),
        bind_ip: pair.record.bind_ip.clone(),
        visitor_port: pair.visitor_port,
        resident_port: pair.resident_port,
        building_id: pair.record.building_id,
    }
}

/// Bind a listener with a large receive buffer, scanning forward for a
/// free port when the requested one is taken.
async fn bind_with_scan(ip: &str, base_port: u16) -> Result<(TcpListener, u16), ServerError> {
    let addr_ip: IpAddr = ip
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    for offset in 0..PORT_SCAN_RANGE {
        let Some(port) = base_port.checked_add(offset) else {
            break;
        };
        let addr = SocketAddr::new(addr_ip, port);
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Err(err) = socket.set_recv_buffer_size(SOCKET_RECV_BUFFER) {
            tracing::debug!(%err, "receive buffer size not applied");
        }
        if socket.bind(addr).is_err() {
            continue;
        }
        match socket.listen(LISTEN_BACKLOG) {
            Ok(listener) => {
                let port = listener.local_addr().map(|a| a.port()).unwrap_or(port);
                return Ok((listener, port));
            }
            Err(_) => continue,
        }
    }

    Err(ServerError::NoFreePort {
        base: base_port,
        scanned: PORT_SCAN_RANGE,
    })
}

async fn accept_loop(listener: TcpListener, role: TurnRole, deps: LegDeps, port: u16) {
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                tokio::spawn(run_leg(role, stream, deps.clone(), port));
            }
            Err(err) => {
                tracing::warn!(%err, port, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}
