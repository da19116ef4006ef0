//! Launch planning: request(s) + locations -> worker specs.

use std::collections::HashSet;

use farescout_core::{Location, SearchRequest, WorkerSpec, BASELINE_LOCATION_ID};
use farescout_storage::output_target;
use uuid::Uuid;

fn unit_id_for(location: &Location, request: &SearchRequest, dated: bool) -> String {
    if dated {
        format!("{}@{}", location.id, request.date_label())
    } else {
        location.id.clone()
    }
}

fn plan_request(
    run_id: Uuid,
    request: &SearchRequest,
    locations: &[Location],
    dated: bool,
) -> Vec<WorkerSpec> {
    let mut seen: HashSet<&str> = HashSet::from([BASELINE_LOCATION_ID]);
    let baseline = Location::baseline();
    let fanned_out = locations.iter().filter(|l| seen.insert(l.id.as_str()));

    std::iter::once(&baseline)
        .chain(fanned_out)
        .map(|location| {
            let unit_id = unit_id_for(location, request, dated);
            WorkerSpec {
                run_id,
                output_target: output_target(run_id, &unit_id),
                unit_id,
                location: location.clone(),
                request: request.clone(),
            }
        })
        .collect()
}

/// Baseline first, then one spec per location in input order. Locations
/// with the baseline id or an id already planned are skipped.
pub fn plan(run_id: Uuid, request: &SearchRequest, locations: &[Location]) -> Vec<WorkerSpec> {
    plan_request(run_id, request, locations, false)
}

/// `plan` for every request of a date matrix, in request order. Unit ids
/// carry a `@{departure}_{return}` suffix once more than one pair is planned.
pub fn plan_matrix(
    run_id: Uuid,
    requests: &[SearchRequest],
    locations: &[Location],
) -> Vec<WorkerSpec> {
    let dated = requests.len() > 1;
    requests
        .iter()
        .flat_map(|request| plan_request(run_id, request, locations, dated))
        .collect()
}
