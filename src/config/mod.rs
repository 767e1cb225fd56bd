pub mod printer_config;
pub mod printer_id;

use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{debug, info};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path, sync::Arc};
use tokio::sync::RwLock;

use crate::config::{printer_config::PrinterConfigFlashForge, printer_id::PrinterId};

/// Registry of configured printers, shared between tasks.
#[derive(Clone)]
pub struct AppConfig {
    ids: Arc<RwLock<HashSet<PrinterId>>>,
    printers: Arc<DashMap<PrinterId, Arc<RwLock<PrinterConfigFlashForge>>>>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::empty()
    }
}

/// On-disk layout
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    printers: Vec<PrinterConfigFlashForge>,
}

/// save, load
impl AppConfig {
    pub fn empty() -> Self {
        Self {
            ids: Arc::new(RwLock::new(HashSet::new())),
            printers: Arc::new(DashMap::new()),
        }
    }

    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config {}", path.display()))?;
        let file: ConfigFile = toml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;

        let out = Self::empty();
        for mut printer in file.printers {
            if printer.id.is_empty() {
                printer.id = PrinterId::generate();
                debug!("assigned id {} to printer {}", printer.id, printer.name);
            }
            printer
                .validate()
                .with_context(|| format!("invalid printer entry {:?}", printer.name))?;
            out.add_printer(printer).await?;
        }

        info!("loaded {} printer(s) from {}", out.printers.len(), path.display());
        Ok(out)
    }

    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = ConfigFile::default();
        for id in self.printer_ids().await {
            if let Some(printer) = self.get_printer(&id) {
                file.printers.push(printer.read().await.clone());
            }
        }

        let text = toml::to_string_pretty(&file)?;
        tokio::fs::write(path.as_ref(), text).await?;
        Ok(())
    }
}

impl AppConfig {
    pub async fn add_printer(&self, config: PrinterConfigFlashForge) -> Result<()> {
        let id = config.id.clone();
        ensure!(!id.is_empty(), "printer has no id");

        let mut ids = self.ids.write().await;
        if ids.contains(&id) {
            bail!("printer already exists: {}", id);
        }
        ids.insert(id.clone());
        self.printers.insert(id, Arc::new(RwLock::new(config)));
        Ok(())
    }

    pub async fn remove_printer(&self, id: &PrinterId) -> Result<()> {
        if !self.ids.write().await.remove(id) {
            return Err(anyhow!("no such printer: {}", id));
        }
        self.printers.remove(id);
        Ok(())
    }

    pub async fn printer_ids(&self) -> Vec<PrinterId> {
        let mut ids: Vec<_> = self.ids.read().await.iter().cloned().collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    pub fn get_printer(&self, id: &PrinterId) -> Option<Arc<RwLock<PrinterConfigFlashForge>>> {
        self.printers.get(id).map(|v| v.value().clone())
    }
}
