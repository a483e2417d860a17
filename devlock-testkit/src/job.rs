use devlock::Job;

/// A configuration job with a small realistic payload.
pub fn config_job(job_id: &str, device: &str) -> Job {
    Job::new(job_id, device)
        .with_field("vlan", 10)
        .with_field("description", format!("change {job_id}"))
}

/// Wire form of [`config_job`].
pub fn config_job_bytes(job_id: &str, device: &str) -> Vec<u8> {
    serde_json::to_vec(&config_job(job_id, device)).unwrap_or_default()
}
