// src/presentation.rs

//! View-facing shapes derived from engine state. Nothing here renders.

use crate::events::Notice;
use crate::models::DownloadState;

/// What the install button of a row or detail header shows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InstallButton {
    Get,
    /// A progress ring instead of a label.
    Progress(f64),
    Resume,
    Open,
    Redownload,
}

impl InstallButton {
    pub fn label(&self) -> &'static str {
        match self {
            InstallButton::Get => "GET",
            InstallButton::Progress(_) => "",
            InstallButton::Resume => "RESUME",
            InstallButton::Open => "OPEN",
            InstallButton::Redownload => "REDOWNLOAD",
        }
    }

    /// Tapping a ring pauses; tapping a label starts, resumes or opens.
    pub fn tap_pauses(&self) -> bool {
        matches!(self, InstallButton::Progress(_))
    }
}

impl From<DownloadState> for InstallButton {
    fn from(state: DownloadState) -> Self {
        match state {
            DownloadState::NotStarted => InstallButton::Get,
            DownloadState::Downloading(p) => InstallButton::Progress(p),
            DownloadState::Paused(_) => InstallButton::Resume,
            DownloadState::Completed => InstallButton::Open,
            DownloadState::NeedsRedownload => InstallButton::Redownload,
        }
    }
}

/// One-shot network banner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkBanner {
    pub message: String,
    pub is_warning: bool,
}

impl From<&Notice> for NetworkBanner {
    fn from(notice: &Notice) -> Self {
        match notice {
            Notice::DownloadsPausedOffline { ids } => NetworkBanner {
                message: match ids.len() {
                    1 => "Connection lost. 1 download was paused.".to_string(),
                    n => format!("Connection lost. {n} downloads were paused."),
                },
                is_warning: true,
            },
            Notice::ConnectivityRestored => NetworkBanner {
                message: "Back online. Tap resume to continue your downloads.".to_string(),
                is_warning: false,
            },
        }
    }
}
