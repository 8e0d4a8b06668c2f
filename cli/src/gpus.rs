//! GPU availability on the login node or in a scheduler partition

use rex_core::RemoteSession;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

const GPU_QUERY: &str = "nvidia-smi --query-gpu=index,name,memory.used,memory.total,utilization.gpu --format=csv,noheader,nounits 2>/dev/null";

/// Emits `index,pid,memory_mb,user` for every compute process
const PROCESS_QUERY: &str = r#"declare -A idx
while IFS=', ' read -r i uuid; do idx[$uuid]=$i; done < <(nvidia-smi --query-gpu=index,uuid --format=csv,noheader 2>/dev/null)
nvidia-smi --query-compute-apps=gpu_uuid,pid,used_memory --format=csv,noheader,nounits 2>/dev/null | while IFS=', ' read -r uuid pid mem; do
    [ -n "$pid" ] || continue
    echo "${idx[$uuid]},$pid,$mem,$(ps -o user= -p "$pid" 2>/dev/null)"
done"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuLoad {
    Free,
    Partial,
    Busy,
}

impl GpuLoad {
    fn classify(utilization: u32, memory_percent: u64) -> Self {
        if utilization < 10 && memory_percent < 10 {
            Self::Free
        } else if utilization < 50 {
            Self::Partial
        } else {
            Self::Busy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Partial => "partial",
            Self::Busy => "busy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuProcess {
    pub user: String,
    pub pid: u32,
    /// MiB
    pub memory: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Gpu {
    pub index: u32,
    pub name: String,
    pub memory_used: u64,
    pub memory_total: u64,
    pub memory_percent: u64,
    pub utilization: u32,
    pub status: GpuLoad,
    pub processes: Vec<GpuProcess>,
}

/// Group `index,pid,memory,user` lines by GPU index
pub fn parse_processes(output: &str) -> BTreeMap<u32, Vec<GpuProcess>> {
    let mut by_gpu: BTreeMap<u32, Vec<GpuProcess>> = BTreeMap::new();

    for line in output.lines() {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 3 {
            continue;
        }
        let (Ok(index), Ok(pid), Ok(memory)) = (
            fields[0].parse::<u32>(),
            fields[1].parse::<u32>(),
            fields[2].parse::<u64>(),
        ) else {
            debug!(line, "Skipping process line");
            continue;
        };
        let user = fields.get(3).filter(|u| !u.is_empty()).unwrap_or(&"?");

        by_gpu.entry(index).or_default().push(GpuProcess {
            user: user.to_string(),
            pid,
            memory,
        });
    }

    by_gpu
}

/// Parse `nvidia-smi` CSV rows, attaching processes by index
pub fn parse_gpus(output: &str, mut processes: BTreeMap<u32, Vec<GpuProcess>>) -> Vec<Gpu> {
    let mut gpus = Vec::new();

    for line in output.lines() {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 5 {
            continue;
        }
        let (Ok(index), Ok(memory_used), Ok(total), Ok(utilization)) = (
            fields[0].parse::<u32>(),
            fields[2].parse::<u64>(),
            fields[3].parse::<u64>(),
            fields[4].parse::<u32>(),
        ) else {
            debug!(line, "Skipping GPU line");
            continue;
        };
        let memory_total = total.max(1);
        let memory_percent = memory_used * 100 / memory_total;

        gpus.push(Gpu {
            index,
            name: fields[1].to_string(),
            memory_used,
            memory_total,
            memory_percent,
            utilization,
            status: GpuLoad::classify(utilization, memory_percent),
            processes: processes.remove(&index).unwrap_or_default(),
        });
    }

    gpus
}

/// GPUs visible on the session's host
pub async fn query(session: &dyn RemoteSession) -> anyhow::Result<Vec<Gpu>> {
    let gpus = session.exec(GPU_QUERY).await?;
    if gpus.text().is_empty() {
        return Ok(Vec::new());
    }

    let procs = session
        .exec(&format!("bash -c {}", rex_core::script::quote(PROCESS_QUERY)))
        .await?;
    Ok(parse_gpus(&gpus.stdout, parse_processes(&procs.stdout)))
}

/// Text table, or a JSON array
pub fn render(gpus: &[Gpu], json: bool) -> anyhow::Result<String> {
    if json {
        return Ok(serde_json::to_string_pretty(gpus)?);
    }

    let mut lines = Vec::new();
    for gpu in gpus {
        lines.push(format!(
            "GPU {}: {:<20} {:>5}MB/{:>5}MB ({:>2}%)  util: {:>3}%  {}",
            gpu.index,
            gpu.name,
            gpu.memory_used,
            gpu.memory_total,
            gpu.memory_percent,
            gpu.utilization,
            gpu.status.as_str()
        ));
        for proc in &gpu.processes {
            lines.push(format!(
                "       └─ {:<12} PID {:<8} {:>5}MB",
                proc.user, proc.pid, proc.memory
            ));
        }
    }
    Ok(lines.join("\n"))
}

/// `node gres` lines for GPU nodes in a partition
pub async fn partition_nodes(
    session: &dyn RemoteSession,
    partition: Option<&str>,
) -> anyhow::Result<Vec<String>> {
    let filter = partition
        .map(|p| format!("-p {} ", rex_core::script::quote(p)))
        .unwrap_or_default();
    let output = session
        .exec(&format!(
            "sinfo {filter}-N -o '%N %G' --noheader 2>/dev/null | grep -v '(null)' | sort -u"
        ))
        .await?;

    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}
