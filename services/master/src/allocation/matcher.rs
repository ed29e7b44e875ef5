//! Capability matching.
//!
//! Everything here is pure: given the same request and candidate list the
//! same device is chosen. Candidates are tried in store iteration order and
//! the first one passing every filter wins.

use std::collections::HashSet;

use devlab_model::{major_version, Device, DeviceRequest, DeviceRestrictionRequest};

use crate::store::{extract_job_name, TeamDirectory, TeamPool};

/// Whether `device` satisfies `request`.
///
/// Filters apply in order and must all pass. Name, brand and version accept
/// comma-separated alternatives.
pub fn matches(request: &DeviceRequest, device: &Device) -> bool {
    if device.blacklisted || !device.free {
        return false;
    }

    if let Some(android) = request.is_android {
        if device.is_android != android {
            return false;
        }
    }

    if let Some(real) = request.is_real_device {
        if device.is_real_device != real {
            return false;
        }
    }

    if let Some(names) = non_blank(&request.device_name) {
        let market_name = device.market_name.as_deref().unwrap_or_default();
        if !any_contains(names, &[device.model.as_str(), market_name]) {
            return false;
        }
    }

    if let Some(brands) = non_blank(&request.brand) {
        if !any_contains(brands, &[device.manufacturer.as_str()]) {
            return false;
        }
    }

    if let Some(versions) = non_blank(&request.version) {
        if !major_in(versions, device.major_version()) {
            return false;
        }
    }

    true
}

/// First candidate satisfying `request`.
pub fn select<'a>(request: &DeviceRequest, candidates: &'a [Device]) -> Option<&'a Device> {
    candidates.iter().find(|d| matches(request, d))
}

/// Every candidate satisfying `request`, in order.
pub fn matching<'a>(
    request: &'a DeviceRequest,
    candidates: &'a [Device],
) -> impl Iterator<Item = &'a Device> + 'a {
    candidates.iter().filter(move |d| matches(request, d))
}

/// Team the request allocates for: the named team, or the team owning the
/// job in the job link.
pub fn resolve_team<'a>(request: &DeviceRequest, teams: &'a TeamDirectory) -> Option<TeamRef<'a>> {
    if let Some(name) = non_blank(&request.team) {
        return Some(match teams.get(name) {
            Some(pool) => TeamRef::Known(pool),
            None => TeamRef::Unknown(name.to_string()),
        });
    }

    let job = request.job_link.as_deref().and_then(extract_job_name)?;
    teams.team_for_job(job).map(TeamRef::Known)
}

/// A team named by a request, possibly absent from the directory.
#[derive(Debug, Clone)]
pub enum TeamRef<'a> {
    Known(&'a TeamPool),
    Unknown(String),
}

impl TeamRef<'_> {
    pub fn name(&self) -> &str {
        match self {
            TeamRef::Known(pool) => &pool.name,
            TeamRef::Unknown(name) => name,
        }
    }

    fn pool(&self) -> Option<&TeamPool> {
        match self {
            TeamRef::Known(pool) => Some(pool),
            TeamRef::Unknown(_) => None,
        }
    }
}

/// Restrict `devices` to what the requesting team may use.
///
/// The team's own pool comes first, followed by the shared pool. Devices
/// reserved by other teams are dropped. When the job has pinned devices
/// only those remain; otherwise devices pinned to any of the team's jobs
/// are dropped. An empty pool list places no restriction. Requests without
/// a team pass through untouched.
pub fn team_pool(request: &DeviceRequest, devices: Vec<Device>, teams: &TeamDirectory) -> Vec<Device> {
    if teams.is_empty() {
        return devices;
    }
    let Some(team) = resolve_team(request, teams) else {
        return devices;
    };

    let platform = request.is_android;
    let job = request.job_link.as_deref().and_then(extract_job_name);

    if let Some(pinned) = team
        .pool()
        .zip(job)
        .and_then(|(pool, job)| pool.pinned_for(job))
    {
        return devices
            .into_iter()
            .filter(|d| pinned.contains(d.id.as_str()))
            .collect();
    }

    let reserved = teams.reserved_by_others(team.name(), platform);
    let pinned_any = team.pool().map(TeamPool::all_pinned).unwrap_or_default();
    let allowed = |d: &Device| {
        !reserved.contains(d.id.as_str()) && !pinned_any.contains(d.id.as_str())
    };

    let own: HashSet<&str> = team
        .pool()
        .map(|pool| pool.devices_for(platform))
        .unwrap_or_default();
    let common: HashSet<&str> = teams
        .common()
        .map(|pool| pool.devices_for(platform))
        .unwrap_or_default();

    let in_pool = |ids: &HashSet<&str>, d: &Device| ids.is_empty() || ids.contains(d.id.as_str());

    let (mut first, rest): (Vec<Device>, Vec<Device>) = devices
        .into_iter()
        .filter(|d| allowed(d))
        .partition(|d| in_pool(&own, d));
    first.extend(rest.into_iter().filter(|d| in_pool(&common, d)));
    first
}

/// Whether `device` is selected by a bulk restriction.
///
/// `host` narrows the selection. The other fields are alternatives: a
/// device matches when any of them matches. A restriction carrying only
/// `host` selects every device on that host.
pub fn matches_restriction(restriction: &DeviceRestrictionRequest, device: &Device) -> bool {
    if let Some(host) = non_blank(&restriction.host) {
        if !device.host.eq_ignore_ascii_case(host.trim()) {
            return false;
        }
    }

    let brand = non_blank(&restriction.brand);
    let name = non_blank(&restriction.name);
    let version = non_blank(&restriction.version);

    if restriction.device_ids.is_empty() && brand.is_none() && name.is_none() && version.is_none()
    {
        return true;
    }

    restriction.device_ids.iter().any(|id| id == &device.id)
        || brand.is_some_and(|b| any_equals(b, &[device.manufacturer.as_str()]))
        || name.is_some_and(|n| {
            any_equals(
                n,
                &[device.model.as_str(), device.market_name.as_deref().unwrap_or_default()],
            )
        })
        || version.is_some_and(|v| major_in(v, device.major_version()))
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

fn alternatives(list: &str) -> impl Iterator<Item = String> + '_ {
    list.split(',')
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
}

fn any_contains(list: &str, fields: &[&str]) -> bool {
    let fields: Vec<String> = fields.iter().map(|f| f.to_lowercase()).collect();
    alternatives(list).any(|wanted| fields.iter().any(|f| f.contains(&wanted)))
}

fn any_equals(list: &str, fields: &[&str]) -> bool {
    alternatives(list).any(|wanted| fields.iter().any(|f| f.eq_ignore_ascii_case(&wanted)))
}

fn major_in(list: &str, device_major: &str) -> bool {
    list.split(',')
        .map(major_version)
        .filter(|v| !v.is_empty())
        .any(|v| v == device_major)
}
