//! 备份 / 迁移共享组件
//!
//! 提供备份管理器、版本注册表和迁移协调器共用的工具函数
//! - SHA256计算: 用于文件完整性校验
//! - 原子写入: 临时文件 + fsync + 重命名
//! - 磁盘空间探测: 迁移前 / 备份前的空间预检查

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

/// 记录并跳过迭代中的错误，避免 `.flatten()` 静默丢弃
pub fn log_and_skip_entry_err<T, E: std::fmt::Display>(
    result: std::result::Result<T, E>,
) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("[BackupCommon] Directory entry read error (skipped): {}", e);
            None
        }
    }
}

/// 计算文件的SHA256哈希值
///
/// 使用8KB缓冲区分块读取，适合处理大文件而不会占用过多内存
///
/// # Returns
/// * `Ok(String)` - 十六进制格式的SHA256哈希值
/// * `Err(io::Error)` - 文件打开或读取失败
pub fn calculate_file_hash(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;

    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192]; // 8KB 缓冲区

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// 计算字节数组的SHA256哈希值
pub fn calculate_bytes_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// 计算一组文件的聚合校验和
///
/// 按文件名排序后逐个计算 SHA256，再对 `name:hash` 行整体求 SHA256，
/// 保证同一组文件无论枚举顺序如何都得到相同结果。
pub fn calculate_files_checksum(files: &[PathBuf]) -> io::Result<String> {
    let mut entries: Vec<(String, String)> = Vec::with_capacity(files.len());
    for path in files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        entries.push((name, calculate_file_hash(path)?));
    }
    entries.sort();

    let mut canonical = String::new();
    for (name, hash) in &entries {
        canonical.push_str(name);
        canonical.push(':');
        canonical.push_str(hash);
        canonical.push('\n');
    }
    Ok(calculate_bytes_hash(canonical.as_bytes()))
}

/// 原子写入 JSON 文件
///
/// 使用"临时文件 + 原子重命名"模式，确保写入过程中断时不会留下半截文件。
/// 1. 先写入临时文件 (`<name>.tmp`)
/// 2. 同步到磁盘
/// 3. 原子重命名为目标文件
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_bytes_atomic(path, json.as_bytes())
}

/// 原子写入任意字节内容
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut temp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|e| {
        // 重命名失败时尝试清理临时文件
        let _ = fs::remove_file(&temp_path);
        e
    })
}

/// 统计目录下所有文件的总大小（字节）
pub fn directory_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(log_and_skip_entry_err)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

// ============================================================================
// 磁盘空间
// ============================================================================

/// 获取指定路径所在磁盘的可用空间（字节）
///
/// 使用系统 API（Unix: statvfs, Windows: GetDiskFreeSpaceExW）。
/// 路径不存在时向上查找最近的已存在目录。
pub fn get_available_disk_space(path: &Path) -> io::Result<u64> {
    let check_path = nearest_existing_ancestor(path);

    #[cfg(unix)]
    {
        match get_disk_space_statvfs(&check_path) {
            Ok(bytes) => return Ok(bytes),
            Err(e) => {
                tracing::warn!("[BackupCommon] statvfs 调用失败: {}", e);
            }
        }
    }

    #[cfg(windows)]
    {
        match get_disk_space_win32(&check_path) {
            Ok(bytes) => return Ok(bytes),
            Err(e) => {
                tracing::warn!("[BackupCommon] GetDiskFreeSpaceExW 调用失败: {}", e);
            }
        }
    }

    // 无法获取磁盘空间时默认拒绝操作（安全优先）
    // 可通过环境变量 WEALTHWISE_ALLOW_UNKNOWN_DISK_SPACE=1 启用回退模式
    let allow_fallback = std::env::var("WEALTHWISE_ALLOW_UNKNOWN_DISK_SPACE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if allow_fallback {
        tracing::warn!("无法获取磁盘可用空间，使用保守估计值 1GB（已通过环境变量启用回退模式）");
        Ok(1024 * 1024 * 1024)
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("无法获取磁盘可用空间: {}", check_path.display()),
        ))
    }
}

fn nearest_existing_ancestor(path: &Path) -> PathBuf {
    let mut current = Some(path);
    while let Some(candidate) = current {
        if candidate.exists() {
            return candidate.to_path_buf();
        }
        current = candidate.parent();
    }
    #[cfg(windows)]
    {
        PathBuf::from("C:\\")
    }
    #[cfg(not(windows))]
    {
        PathBuf::from("/")
    }
}

/// Unix: 使用 libc::statvfs 系统调用获取磁盘可用空间
///
/// f_bavail * f_frsize = 非特权用户可用的字节数。
#[cfg(unix)]
fn get_disk_space_statvfs(path: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };

    if ret == 0 {
        #[allow(clippy::unnecessary_cast)]
        let available = stat.f_bavail as u64 * stat.f_frsize as u64;
        tracing::debug!(
            "[BackupCommon] statvfs 成功: path={}, available={} bytes",
            path.display(),
            available
        );
        Ok(available)
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Windows: 使用 GetDiskFreeSpaceExW 获取磁盘可用空间
#[cfg(windows)]
fn get_disk_space_win32(path: &Path) -> io::Result<u64> {
    use std::os::windows::ffi::OsStrExt;

    let wide_path: Vec<u16> = path
        .as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();

    #[link(name = "kernel32")]
    extern "system" {
        fn GetDiskFreeSpaceExW(
            lpDirectoryName: *const u16,
            lpFreeBytesAvailableToCaller: *mut u64,
            lpTotalNumberOfBytes: *mut u64,
            lpTotalNumberOfFreeBytes: *mut u64,
        ) -> i32;
    }

    let mut free_available: u64 = 0;
    let mut total: u64 = 0;
    let mut total_free: u64 = 0;
    let ok = unsafe {
        GetDiskFreeSpaceExW(
            wide_path.as_ptr(),
            &mut free_available,
            &mut total,
            &mut total_free,
        )
    };
    if ok != 0 {
        Ok(free_available)
    } else {
        Err(io::Error::last_os_error())
    }
}
