//! Drift policy: live state wins.
//!
//! Every read replaces the tracked spec with what the platform reports. The
//! few fields the platform does not keep are carried over from the prior
//! belief, and [`diff`] lists what an operator's desired spec would change.

use serde::Serialize;

use crate::model::{Attachment, GuestExtras, GuestSpec, TrackedGuest};

/// Result of refreshing a tracked guest.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Present(TrackedGuest),
    /// The guest no longer exists; drop it from tracked state.
    Gone,
}

impl ReadOutcome {
    pub fn into_tracked(self) -> Option<TrackedGuest> {
        match self {
            ReadOutcome::Present(tracked) => Some(tracked),
            ReadOutcome::Gone => None,
        }
    }
}

/// Copies fields the platform does not track from `prior` into `observed`.
pub fn carry_over(prior: &GuestSpec, observed: &mut GuestSpec) {
    observed.clone.clone_from(&prior.clone);

    if let (
        GuestExtras::Lxc {
            ostemplate,
            password,
            ssh_public_keys,
            ..
        },
        GuestExtras::Lxc {
            ostemplate: prior_template,
            password: prior_password,
            ssh_public_keys: prior_keys,
            ..
        },
    ) = (&mut observed.extras, &prior.extras)
    {
        ostemplate.clone_from(prior_template);
        password.clone_from(prior_password);
        ssh_public_keys.clone_from(prior_keys);
    }
}

/// One field whose observed value differs from the desired one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDrift {
    pub field: String,
    pub desired: String,
    pub observed: String,
}

impl std::fmt::Display for FieldDrift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} -> {}", self.field, self.observed, self.desired)
    }
}

#[derive(Default)]
struct DriftList(Vec<FieldDrift>);

impl DriftList {
    fn check<T: PartialEq + std::fmt::Display>(&mut self, field: &str, desired: &T, observed: &T) {
        if desired != observed {
            self.push(field, desired.to_string(), observed.to_string());
        }
    }

    /// Compares only when `desired` is set.
    fn check_opt<T: PartialEq + std::fmt::Display>(
        &mut self,
        field: &str,
        desired: &Option<T>,
        observed: &Option<T>,
    ) {
        if let Some(want) = desired {
            if Some(want) != observed.as_ref() {
                let have = observed
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "(unset)".to_string());
                self.push(field, want.to_string(), have);
            }
        }
    }

    fn push(&mut self, field: &str, desired: String, observed: String) {
        self.0.push(FieldDrift {
            field: field.to_string(),
            desired,
            observed,
        });
    }
}

/// Fields where `observed` differs from `desired`.
///
/// Optional desired fields left unset are not compared, and neither are
/// computed fields such as volume references and addresses unless the
/// desired spec pins them.
pub fn diff(desired: &GuestSpec, observed: &GuestSpec) -> Vec<FieldDrift> {
    let mut drift = DriftList::default();

    drift.check_opt("name", &desired.name, &observed.name);
    drift.check_opt("description", &desired.description, &observed.description);
    drift.check("cores", &desired.cores, &observed.cores);
    drift.check("memory", &desired.memory, &observed.memory);
    drift.check("status", &desired.status, &observed.status);

    match (&desired.extras, &observed.extras) {
        (
            GuestExtras::Qemu { agent, sockets },
            GuestExtras::Qemu {
                agent: seen_agent,
                sockets: seen_sockets,
            },
        ) => {
            drift.check("agent", agent, seen_agent);
            drift.check("sockets", sockets, seen_sockets);
        }
        (
            GuestExtras::Lxc {
                ostemplate,
                unprivileged,
                ostype,
                password,
                ssh_public_keys,
            },
            GuestExtras::Lxc {
                ostemplate: seen_template,
                unprivileged: seen_unprivileged,
                ostype: seen_ostype,
                password: seen_password,
                ssh_public_keys: seen_keys,
            },
        ) => {
            drift.check_opt("ostemplate", ostemplate, seen_template);
            drift.check("unprivileged", unprivileged, seen_unprivileged);
            drift.check_opt("ostype", ostype, seen_ostype);
            if password.is_some() && password != seen_password {
                drift.push("password", "(redacted)".to_string(), "(redacted)".to_string());
            }
            drift.check_opt("ssh_public_keys", ssh_public_keys, seen_keys);
        }
        (want, have) => drift.push("kind", want.kind().to_string(), have.kind().to_string()),
    }

    for (slot, want) in &desired.attachments {
        let field = format!("attachments.{}", slot);
        match observed.attachments.get(slot) {
            None => drift.push(&field, want.kind_name().to_string(), "(absent)".to_string()),
            Some(have) => diff_attachment(&mut drift, &field, want, have),
        }
    }
    for (slot, have) in &observed.attachments {
        if !desired.attachments.contains_key(slot) {
            drift.push(
                &format!("attachments.{}", slot),
                "(absent)".to_string(),
                have.kind_name().to_string(),
            );
        }
    }

    drift.0
}

fn diff_attachment(drift: &mut DriftList, field: &str, want: &Attachment, have: &Attachment) {
    match (want, have) {
        (Attachment::Disk(want), Attachment::Disk(have)) => {
            drift.check_opt(&format!("{}.storage", field), &want.storage, &have.storage);
            drift.check_opt(&format!("{}.size", field), &want.size, &have.size);
            drift.check_opt(&format!("{}.mount_path", field), &want.mount_path, &have.mount_path);
            drift.check_opt(&format!("{}.volume", field), &want.volume, &have.volume);
        }
        (Attachment::Optical { iso: want }, Attachment::Optical { iso: have }) => {
            drift.check(&format!("{}.iso", field), want, have);
        }
        (Attachment::Network(want), Attachment::Network(have)) => {
            drift.check(&format!("{}.bridge", field), &want.bridge, &have.bridge);
            drift.check_opt(&format!("{}.name", field), &want.name, &have.name);
            drift.check_opt(&format!("{}.model", field), &want.model, &have.model);
            drift.check_opt(&format!("{}.ip", field), &want.ip, &have.ip);
            drift.check_opt(&format!("{}.gateway", field), &want.gateway, &have.gateway);
            drift.check_opt(&format!("{}.mac", field), &want.mac, &have.mac);
        }
        (want, have) => drift.push(
            field,
            want.kind_name().to_string(),
            have.kind_name().to_string(),
        ),
    }
}
