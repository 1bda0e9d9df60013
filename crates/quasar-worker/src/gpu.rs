use tokio::process::Command;

use quasar_common::GpuStatus;

/// Query `nvidia-smi`. Hosts without it report no GPUs.
pub async fn read_gpu_statuses() -> Vec<GpuStatus> {
    let output = Command::new("nvidia-smi")
        .arg("--query-gpu=index,memory.total,memory.used")
        .arg("--format=csv,noheader,nounits")
        .output()
        .await;

    match output {
        Ok(o) if o.status.success() => parse_gpu_csv(&String::from_utf8_lossy(&o.stdout)),
        _ => Vec::new(),
    }
}

fn parse_gpu_csv(stdout: &str) -> Vec<GpuStatus> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split(',').map(str::trim);
            let index = parts.next()?.parse().ok()?;
            let memory_total_mb = parts.next()?.parse().ok()?;
            let memory_used_mb = parts.next()?.parse().ok()?;
            Some(GpuStatus {
                index,
                memory_total_mb,
                memory_used_mb,
            })
        })
        .collect()
}
