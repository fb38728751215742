//! File path translator part: tells the writer how the data directory is mounted
//! on a Windows host.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ScanResult;
use crate::hooks::Hook;
use crate::info::Info;
use crate::part::{Part, PartRegistrar};

/// Mount settings saved with a design.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslatorSettings {
    /// Drive letter, e.g. `X:`
    pub drive: String,
    /// Unix directory shared as that drive
    pub mount_unix: String,
    /// UNC prefix used instead of the drive when not empty
    #[serde(default)]
    pub network_prefix: String,
}

/// Contributes the single `FilePathTranslator` info to ReportStatus.
#[derive(Debug)]
pub struct FilePathTranslatorPart {
    name: String,
    settings: Mutex<TranslatorSettings>,
}

impl FilePathTranslatorPart {
    /// Translate paths under `mount_unix` onto `drive`.
    pub fn new(name: impl Into<String>, drive: impl Into<String>, mount_unix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: Mutex::new(TranslatorSettings {
                drive: drive.into(),
                mount_unix: mount_unix.into(),
                network_prefix: String::new(),
            }),
        }
    }

    /// Use a UNC share instead of the drive letter.
    pub fn with_network_prefix(self, prefix: impl Into<String>) -> Self {
        self.settings.lock().network_prefix = prefix.into();
        self
    }

    fn report(&self) -> Vec<Info> {
        let settings = self.settings.lock();
        vec![Info::FilePathTranslator {
            drive: settings.drive.clone(),
            mount_unix: settings.mount_unix.clone(),
            network_prefix: settings.network_prefix.clone(),
        }]
    }

    fn save(&self) -> ScanResult<Vec<Info>> {
        let settings = self.settings.lock().clone();
        Ok(vec![Info::PartDesign(serde_json::to_value(settings)?)])
    }

    fn load(&self, design: Option<Value>) -> ScanResult<Vec<Info>> {
        if let Some(design) = design {
            *self.settings.lock() = serde_json::from_value(design)?;
        }
        Ok(vec![])
    }
}

impl Part for FilePathTranslatorPart {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(self: Arc<Self>, registrar: &mut PartRegistrar) {
        registrar.hook(Hook::ReportStatus, &self, |part, _ctx, _call| async move { Ok(part.report()) });
        registrar.hook(Hook::Save, &self, |part, _ctx, _call| async move { part.save() });
        registrar.hook(Hook::Load, &self, |part, _ctx, call| async move {
            let design = call.load_for(&part.name)?;
            part.load(design)
        });
    }
}
