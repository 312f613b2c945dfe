//! System-backed `MapperProvider` implementation.

use crate::command::ToolCommand;
use basalt_core::error::{BasaltError, BasaltResult};
use basalt_core::BasaltConfig;
use basalt_provider::{
    CryptTarget, DiscardMode, LoopOptions, MapperProvider, MappingDescriptor, MappingKind,
    VerityTarget,
};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Provider that drives `losetup`, `dmsetup` and `blkdiscard`.
#[derive(Debug, Clone)]
pub struct SystemMapper {
    dmsetup: ToolCommand,
    losetup: ToolCommand,
    blkdiscard: ToolCommand,
}

impl SystemMapper {
    /// Build a provider from configuration.
    ///
    /// Explicitly configured binaries must exist. Tools that are neither
    /// configured nor found on the host are reported when first used, so
    /// commands that never touch them (signing, `info`) still work.
    pub fn from_config(config: &BasaltConfig) -> BasaltResult<Self> {
        let mapper = &config.mapper;
        for (field, configured) in [
            ("mapper.dmsetup_path", &mapper.dmsetup_path),
            ("mapper.losetup_path", &mapper.losetup_path),
            ("mapper.blkdiscard_path", &mapper.blkdiscard_path),
        ] {
            if let Some(path) = configured.as_deref().map(str::trim) {
                if !path.is_empty() && !Path::new(path).exists() {
                    return Err(BasaltError::InvalidConfig(format!(
                        "{field} points at {path}, which does not exist"
                    )));
                }
            }
        }

        let timeout = config.command_timeout();
        let dmsetup = config.dmsetup_binary();
        if dmsetup.is_none() {
            warn!("dmsetup not found; mapping setup will be unavailable");
        }
        Ok(Self {
            dmsetup: ToolCommand::new("dmsetup", dmsetup, timeout),
            losetup: ToolCommand::new("losetup", config.losetup_binary(), timeout),
            blkdiscard: ToolCommand::new("blkdiscard", config.blkdiscard_binary(), timeout),
        })
    }

    /// Resolve the kernel node of mapping `name` from its minor number.
    fn mapping_node(&self, name: &str) -> BasaltResult<PathBuf> {
        let out = self.dmsetup.run_checked(
            &format!("query mapping `{name}`"),
            &["info", "-c", "--noheadings", "-o", "minor", name],
            None,
        )?;
        let minor = out.stdout.trim();
        minor
            .parse::<u32>()
            .map(|minor| PathBuf::from(format!("/dev/dm-{minor}")))
            .map_err(|_| {
                BasaltError::Provider(format!(
                    "dmsetup reported `{minor}` as the minor number of `{name}`"
                ))
            })
    }

    fn finish_create(
        &self,
        name: &str,
        kind: MappingKind,
        read_only: bool,
    ) -> BasaltResult<MappingDescriptor> {
        match self.mapping_node(name) {
            Ok(device) => {
                debug!("mapping {name} is {}", device.display());
                Ok(MappingDescriptor {
                    name: name.to_string(),
                    device,
                    kind,
                    read_only,
                })
            }
            Err(err) => {
                if let Err(remove_err) =
                    self.dmsetup
                        .run_checked(&format!("remove mapping `{name}`"), &["remove", name], None)
                {
                    warn!("failed to remove half-created mapping {name}: {remove_err}");
                }
                Err(err)
            }
        }
    }
}

impl MapperProvider for SystemMapper {
    type Error = BasaltError;

    fn attach_loop(&self, file: &Path, options: LoopOptions) -> BasaltResult<PathBuf> {
        let offset = options.offset.to_string();
        let size_limit = options.size_limit.map(|limit| limit.to_string());
        let file_arg = file.to_string_lossy();

        let mut args = vec!["--find", "--show"];
        if options.read_only {
            args.push("--read-only");
        }
        if options.offset > 0 {
            args.extend(["--offset", offset.as_str()]);
        }
        if let Some(limit) = size_limit.as_deref() {
            args.extend(["--sizelimit", limit]);
        }
        args.push(&*file_arg);

        let out = self.losetup.run_checked(
            &format!("attach {}", file.display()),
            &args,
            None,
        )?;
        let device = out.stdout.trim();
        if device.is_empty() {
            return Err(BasaltError::Provider(format!(
                "losetup attached {} but printed no device",
                file.display()
            )));
        }
        debug!("attached {} to {device}", file.display());
        Ok(PathBuf::from(device))
    }

    fn detach_loop(&self, device: &Path) -> BasaltResult<()> {
        let device_arg = device.to_string_lossy();
        self.losetup
            .run_checked(&format!("detach {}", device.display()), &["-d", &*device_arg], None)
            .map(|_| ())
    }

    fn create_verity(&self, name: &str, target: &VerityTarget) -> BasaltResult<MappingDescriptor> {
        let table = target.table();
        self.dmsetup.run_checked(
            &format!("create verity mapping `{name}`"),
            &["create", name, "--readonly", "--table", table.as_str()],
            None,
        )?;
        self.finish_create(name, MappingKind::Verity, true)
    }

    fn create_crypt(&self, name: &str, target: &CryptTarget) -> BasaltResult<MappingDescriptor> {
        // The table carries the key; dmsetup reads it from stdin.
        let mut table = Zeroizing::new(target.table().as_bytes().to_vec());
        table.push(b'\n');
        self.dmsetup.run_checked(
            &format!("create crypt mapping `{name}`"),
            &["create", name],
            Some(table.as_slice()),
        )?;
        self.finish_create(name, MappingKind::Crypt, false)
    }

    fn discard(&self, device: &Path, mode: DiscardMode) -> BasaltResult<()> {
        let device_arg = device.to_string_lossy();
        let args: Vec<&str> = match mode {
            DiscardMode::Secure => vec!["--secure", &*device_arg],
            DiscardMode::Plain => vec![&*device_arg],
        };
        self.blkdiscard
            .run_checked(&format!("discard {}", device.display()), &args, None)
            .map(|_| ())
    }
}
