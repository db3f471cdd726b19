//! Replication service
//!
//! Runs one monitor task per database and one sync task per replica, and
//! shuts them all down together.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::Db;
use crate::error::{ShadowError, ShadowResult};
use crate::replica::Replica;

pub struct ReplicationService {
    dbs: Vec<Arc<Db>>,
    replicas: Vec<Arc<Replica>>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ReplicationService {
    pub fn new(dbs: Vec<Arc<Db>>, replicas: Vec<Arc<Replica>>) -> Self {
        Self {
            dbs,
            replicas,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Build every database and replica in `config`. A replica with an
    /// invalid configuration is logged and left out.
    pub fn from_config(config: &Config) -> ShadowResult<Self> {
        if config.dbs.is_empty() {
            return Err(ShadowError::Configuration(
                "no databases configured".to_string(),
            ));
        }

        let mut dbs = Vec::new();
        let mut replicas = Vec::new();
        for db_config in &config.dbs {
            let db = Arc::new(Db::new(&db_config.path, db_config.options()));
            for replica_config in &db_config.replicas {
                let name = replica_config.name();
                let built = replica_config
                    .build_client()
                    .and_then(|client| Ok((client, replica_config.options()?)));
                match built {
                    Ok((client, options)) => {
                        replicas.push(Arc::new(Replica::new(
                            name,
                            Arc::clone(&db),
                            client,
                            options,
                        )));
                    }
                    Err(e) => {
                        error!(
                            "Service: skipping replica {} of {}: {}",
                            name,
                            db_config.path.display(),
                            e
                        );
                    }
                }
            }
            dbs.push(db);
        }

        Ok(Self::new(dbs, replicas))
    }

    pub fn dbs(&self) -> &[Arc<Db>] {
        &self.dbs
    }

    pub fn replicas(&self) -> &[Arc<Replica>] {
        &self.replicas
    }

    /// Spawn the background tasks.
    pub fn start(&mut self) {
        for db in &self.dbs {
            let task = Arc::clone(db).monitor(self.shutdown.child_token());
            self.tasks.push(tokio::spawn(task));
        }
        for replica in &self.replicas {
            let task = Arc::clone(replica).run(self.shutdown.child_token());
            self.tasks.push(tokio::spawn(task));
        }
        info!(
            "Service: started {} database(s), {} replica(s)",
            self.dbs.len(),
            self.replicas.len()
        );
    }

    /// Stop every loop between ticks, then do a last sync of each database
    /// and replica and close the databases.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Service: task ended abnormally: {}", e);
            }
        }

        for db in &self.dbs {
            let target = Arc::clone(db);
            match tokio::task::spawn_blocking(move || target.sync()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("Service: final sync of {} failed: {}", db.path().display(), e),
                Err(e) => warn!("Service: final sync of {} failed: {}", db.path().display(), e),
            }
        }
        for replica in &self.replicas {
            if let Err(e) = replica.sync().await {
                warn!("Service: final sync of replica {} failed: {}", replica.name(), e);
            }
        }
        for db in &self.dbs {
            db.close();
        }
        info!("Service: stopped");
    }
}
