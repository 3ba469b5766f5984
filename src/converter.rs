use crate::config::{ConversionConfig, DiskFormat};
use crate::connectors::DiskConverter;
use crate::delta::merge_delta as merge_journal;
use crate::exec::run_local;
use crate::{MigrationError, Result, log_info};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Disk conversion through qemu-img, with virt-v2v and virt-customize for
/// guests that need paravirtual drivers.
pub struct QemuConverter {
    guest_tools_command: String,
}

impl QemuConverter {
    pub fn new(config: &ConversionConfig) -> Self {
        Self {
            guest_tools_command: config.guest_tools_command.clone(),
        }
    }

    async fn qemu_img_convert(
        &self,
        src: &Path,
        src_format: DiskFormat,
        dst: &Path,
        dst_format: DiskFormat,
    ) -> Result<()> {
        let args = vec![
            "convert".to_string(),
            "-f".to_string(),
            src_format.as_str().to_string(),
            "-O".to_string(),
            dst_format.as_str().to_string(),
            path_arg(src),
            path_arg(dst),
        ];
        run_local("qemu-img", &args).await.map_err(as_conversion)?;
        Ok(())
    }

    async fn v2v_convert(&self, src: &Path, dst: &Path, dst_format: DiskFormat) -> Result<()> {
        let out_dir = dst.parent().unwrap_or_else(|| Path::new("."));
        let stem = dst
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "disk".to_string());
        let output_name = format!("v2v-{}", stem);

        let args = vec![
            "-i".to_string(),
            "disk".to_string(),
            path_arg(src),
            "-o".to_string(),
            "local".to_string(),
            "-os".to_string(),
            path_arg(out_dir),
            "-of".to_string(),
            dst_format.as_str().to_string(),
            "-on".to_string(),
            output_name.clone(),
        ];
        run_local("virt-v2v", &args).await.map_err(as_conversion)?;

        // virt-v2v -o local names the first disk <name>-sda and writes a domain XML next to it.
        let produced: PathBuf = out_dir.join(format!("{}-sda", output_name));
        tokio::fs::rename(&produced, dst).await.map_err(|e| {
            MigrationError::Conversion(format!(
                "virt-v2v output {} missing: {}",
                produced.display(),
                e
            ))
        })?;
        let _ = tokio::fs::remove_file(out_dir.join(format!("{}.xml", output_name))).await;

        let customize = vec![
            "-a".to_string(),
            path_arg(dst),
            "--firstboot-command".to_string(),
            self.guest_tools_command.clone(),
        ];
        run_local("virt-customize", &customize)
            .await
            .map_err(as_conversion)?;
        Ok(())
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn as_conversion(err: MigrationError) -> MigrationError {
    match err {
        MigrationError::Command { command, message } => {
            MigrationError::Conversion(format!("{}: {}", command, message))
        }
        other => other,
    }
}

#[async_trait]
impl DiskConverter for QemuConverter {
    fn name(&self) -> &str {
        "qemu-img"
    }

    async fn convert(&self, src: &Path, dst: &Path, inject_drivers: bool) -> Result<()> {
        let src_format = DiskFormat::from_path(src)?;
        let dst_format = DiskFormat::from_path(dst)?;
        if dst_format == DiskFormat::Vhdx {
            return Err(MigrationError::Conversion(
                "converting to vhdx is not supported".to_string(),
            ));
        }

        if inject_drivers {
            log_info!(
                "Converting {} -> {} ({}) with virtio driver injection",
                src.display(),
                dst.display(),
                dst_format.as_str()
            );
            self.v2v_convert(src, dst, dst_format).await
        } else {
            log_info!(
                "Converting {} ({}) -> {} ({})",
                src.display(),
                src_format.as_str(),
                dst.display(),
                dst_format.as_str()
            );
            self.qemu_img_convert(src, src_format, dst, dst_format).await
        }
    }

    async fn merge_delta(&self, base: &Path, delta: &Path, out: &Path) -> Result<()> {
        if DiskFormat::from_path(base)? != DiskFormat::Raw {
            return Err(MigrationError::Conversion(format!(
                "changed blocks can only be merged onto a raw image, not {}",
                base.display()
            )));
        }
        let (base, delta, out) = (base.to_path_buf(), delta.to_path_buf(), out.to_path_buf());
        tokio::task::spawn_blocking(move || merge_journal(&base, &delta, &out))
            .await
            .map_err(|e| MigrationError::State(format!("merge task failed: {}", e)))??;
        Ok(())
    }
}
