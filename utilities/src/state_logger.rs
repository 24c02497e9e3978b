use crate::result::Result;
use serde::Serialize;
use std::{
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::{io::AsyncWriteExt, sync::mpsc, task::JoinHandle};
use tracing::{error, trace};

#[derive(Serialize)]
struct StateLine<'a, T: Serialize> {
    ts_ms: u128,
    state: &'a T,
}

/// Appends a json line to a file every time a different state is received.
/// Producers only ever hand over owned copies so the writer never shares memory
/// with the dispatch loop.
pub struct StateLogger<T>
where
    T: PartialEq + Serialize + Send + Sync + 'static,
{
    current_state: Option<T>,
    file: tokio::fs::File,
    receiver: mpsc::Receiver<T>,
}

impl<T> StateLogger<T>
where
    T: PartialEq + Serialize + Send + Sync + 'static,
{
    pub async fn start(target_file_path: &Path) -> Result<(mpsc::Sender<T>, JoinHandle<()>)> {
        if let Some(parent) = target_file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::options()
            .append(true)
            .create(true)
            .open(target_file_path)
            .await?;
        let (tx, rx) = mpsc::channel::<T>(16);
        let mut state_logger = Self {
            current_state: None,
            file,
            receiver: rx,
        };
        let handle = tokio::spawn(async move {
            while let Some(new_state) = state_logger.receiver.recv().await {
                if state_logger.current_state.as_ref() == Some(&new_state) {
                    trace!("State unchanged, skipping write");
                    continue;
                }
                match state_logger.update_state(new_state).await {
                    Ok(_) => {
                        trace!("snapshot written successfully")
                    }
                    Err(e) => {
                        error!(error=%e, "Error while writing the state snapshot");
                    }
                }
            }
        });
        Ok((tx, handle))
    }
    async fn update_state(&mut self, new_state: T) -> Result<()> {
        let ts_ms = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
        let json_line = serde_json::to_string(&StateLine {
            ts_ms,
            state: &new_state,
        })?;
        self.file.write_all(json_line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        self.file.flush().await?;
        self.current_state = Some(new_state);
        Ok(())
    }
}
