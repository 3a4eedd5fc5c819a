use std::sync::Arc;

use anyhow::{bail, format_err, Error};
use serde_json::{Map, Value};

use proxmox_router::cli::*;
use proxmox_schema::{
    api, ApiStringFormat, ApiType, ArraySchema, EnumEntry, ReturnType, Schema, StringSchema,
};

use pve_storage::plugin::PluginRegistry;
use pve_storage::StorageContext;
use pve_storage_api_types::{
    ContentType, KeepOptions, PruneEntry, StorageConfig, StorageStatus, StorageType, VolumeFormat,
    VolumeInfo, PVE_CONFIG_DIGEST_SCHEMA, STORAGE_ID_SCHEMA, VMID_SCHEMA, VOLUME_ID_SCHEMA,
};
use pve_storage_config::storage::{complete_storage_name, parse_storage_properties};
use pve_storage_config::LocalClusterFs;
use pve_storage_tools::task::LogTaskContext;

const STATUS_LIST_SCHEMA: Schema =
    ArraySchema::new("Storage status list.", &StorageStatus::API_SCHEMA).schema();

const VOLUME_LIST_SCHEMA: Schema =
    ArraySchema::new("Volume list.", &VolumeInfo::API_SCHEMA).schema();

const PRUNE_LIST_SCHEMA: Schema =
    ArraySchema::new("Prune result.", &PruneEntry::API_SCHEMA).schema();

const GUEST_TYPE_SCHEMA: Schema = StringSchema::new("Only consider backups of this guest type.")
    .format(&ApiStringFormat::Enum(&[
        EnumEntry::new("qemu", "Virtual machines."),
        EnumEntry::new("lxc", "Containers."),
    ]))
    .schema();

const SIZE_SCHEMA: Schema =
    StringSchema::new("Size in kilobyte (1024 bytes). Optional suffixes 'M' (megabyte) and 'G' (gigabyte).")
        .schema();

fn storage_context() -> StorageContext {
    StorageContext::new(
        PluginRegistry::with_default_plugins(),
        Arc::new(LocalClusterFs::system()),
        proxmox_sys::nodename(),
    )
}

/// Parse `<number>[KMG]`, plain numbers are KiB.
fn parse_size_kib(size: &str) -> Result<u64, Error> {
    let size = size.trim();
    let (number, factor) = match size.char_indices().last() {
        Some((idx, 'K')) | Some((idx, 'k')) => (&size[..idx], 1),
        Some((idx, 'M')) | Some((idx, 'm')) => (&size[..idx], 1024),
        Some((idx, 'G')) | Some((idx, 'g')) => (&size[..idx], 1024 * 1024),
        _ => (size, 1),
    };

    let number: u64 = number
        .parse()
        .map_err(|_| format_err!("unable to parse size '{}'", size))?;

    match number.checked_mul(factor) {
        Some(0) => bail!("size must be greater than zero"),
        Some(kib) => Ok(kib),
        None => bail!("size '{}' is too large", size),
    }
}

/// Remove the keys handled by the command itself, keep the storage properties.
fn storage_properties(param: Value, handled: &[&str]) -> Result<Map<String, Value>, Error> {
    let mut map = match param {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        _ => bail!("parameters must be an object"),
    };
    for key in handled {
        map.remove(*key);
    }
    Ok(map)
}

#[api(
    input: {
        additional_properties: true,
        properties: {
            "type": {
                type: StorageType,
            },
            storage: {
                schema: STORAGE_ID_SCHEMA,
            },
            password: {
                type: String,
                description: "Password for accessing the share.",
                optional: true,
            },
        },
    },
)]
/// Create a new storage.
fn add(param: Value) -> Result<(), Error> {
    let ty: StorageType = serde_json::from_value(param["type"].clone())?;
    let storage = param["storage"]
        .as_str()
        .ok_or_else(|| format_err!("missing storage ID"))?
        .to_string();
    let password = param["password"].as_str().map(String::from);

    let props = storage_properties(param, &["type", "storage", "password"])?;
    let mut props = parse_storage_properties(ty, &props)?;
    props.insert("storage".to_string(), Value::from(storage));

    let scfg = StorageConfig::from_section(&ty.to_string(), Value::Object(props))?;

    storage_context().create_storage(scfg, password.as_deref())
}

#[api(
    input: {
        additional_properties: true,
        properties: {
            storage: {
                schema: STORAGE_ID_SCHEMA,
            },
            delete: {
                type: String,
                description: "A list of settings you want to delete.",
                optional: true,
            },
            digest: {
                schema: PVE_CONFIG_DIGEST_SCHEMA,
                optional: true,
            },
        },
    },
)]
/// Update storage configuration.
fn set(param: Value) -> Result<(), Error> {
    let storage = param["storage"]
        .as_str()
        .ok_or_else(|| format_err!("missing storage ID"))?
        .to_string();
    let digest = param["digest"].as_str().map(String::from);
    let delete: Vec<String> = param["delete"]
        .as_str()
        .map(|list| {
            list.split(|c: char| c == ',' || c == ';' || c.is_ascii_whitespace())
                .filter(|key| !key.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    let ctx = storage_context();
    let (scfg, _digest) = ctx.read_storage(&storage)?;

    let props = storage_properties(param, &["storage", "delete", "digest"])?;
    let props = parse_storage_properties(scfg.storage_type(), &props)?;

    ctx.update_storage(&storage, Value::Object(props), &delete, digest.as_deref())
}

#[api(
    input: {
        properties: {
            storage: {
                schema: STORAGE_ID_SCHEMA,
            },
            digest: {
                schema: PVE_CONFIG_DIGEST_SCHEMA,
                optional: true,
            },
        },
    },
)]
/// Delete storage configuration.
fn remove(storage: String, digest: Option<String>) -> Result<(), Error> {
    storage_context().delete_storage(&storage, digest.as_deref())
}

#[api(
    input: {
        properties: {
            content: {
                type: ContentType,
                optional: true,
            },
            "output-format": {
                schema: OUTPUT_FORMAT,
                optional: true,
            },
        },
    },
)]
/// Get status for all storages enabled on this node.
fn status(content: Option<ContentType>, param: Value) -> Result<(), Error> {
    let output_format = get_output_format(&param);

    let ctx = storage_context();
    let (cfg, _digest) = ctx.read_config()?;
    let list = ctx.storage_status(&cfg, content)?;

    let mut data = serde_json::to_value(list)?;
    let options = default_table_format_options()
        .column(ColumnConfig::new("storage"))
        .column(ColumnConfig::new("type"))
        .column(ColumnConfig::new("active"))
        .column(ColumnConfig::new("total"))
        .column(ColumnConfig::new("used"))
        .column(ColumnConfig::new("avail"));

    let return_type = ReturnType::new(false, &STATUS_LIST_SCHEMA);
    format_and_print_result_full(&mut data, &return_type, &output_format, &options);

    Ok(())
}

#[api(
    input: {
        properties: {
            storage: {
                schema: STORAGE_ID_SCHEMA,
            },
            vmid: {
                schema: VMID_SCHEMA,
                optional: true,
            },
            content: {
                type: ContentType,
                optional: true,
            },
            "output-format": {
                schema: OUTPUT_FORMAT,
                optional: true,
            },
        },
    },
)]
/// List storage content.
fn list(
    storage: String,
    vmid: Option<u32>,
    content: Option<ContentType>,
    param: Value,
) -> Result<(), Error> {
    let output_format = get_output_format(&param);

    let ctx = storage_context();
    let (cfg, _digest) = ctx.read_config()?;
    let list = ctx.volume_list(&cfg, &storage, vmid, content)?;

    let mut data = serde_json::to_value(list)?;
    let options = default_table_format_options()
        .column(ColumnConfig::new("volid"))
        .column(ColumnConfig::new("format"))
        .column(ColumnConfig::new("content"))
        .column(ColumnConfig::new("size"))
        .column(ColumnConfig::new("vmid"));

    let return_type = ReturnType::new(false, &VOLUME_LIST_SCHEMA);
    format_and_print_result_full(&mut data, &return_type, &output_format, &options);

    Ok(())
}

#[api(
    input: {
        properties: {
            storage: {
                schema: STORAGE_ID_SCHEMA,
            },
            vmid: {
                schema: VMID_SCHEMA,
            },
            filename: {
                description: "The name of the file to create. Empty to pick the next free name.",
            },
            size: {
                schema: SIZE_SCHEMA,
            },
            format: {
                type: VolumeFormat,
                optional: true,
            },
        },
    },
)]
/// Allocate disk images.
fn alloc(
    storage: String,
    vmid: u32,
    filename: String,
    size: String,
    format: Option<VolumeFormat>,
) -> Result<(), Error> {
    let size = parse_size_kib(&size)?;
    let name = Some(filename.as_str()).filter(|name| !name.is_empty());

    let ctx = storage_context();
    let (cfg, _digest) = ctx.read_config()?;
    let volid = ctx.vdisk_alloc(&cfg, &storage, vmid, format, name, size)?;

    println!("successfully created '{}'", volid);
    Ok(())
}

#[api(
    input: {
        properties: {
            volume: {
                schema: VOLUME_ID_SCHEMA,
            },
        },
    },
)]
/// Delete volume.
fn free(volume: String) -> Result<(), Error> {
    let ctx = storage_context();
    let (cfg, _digest) = ctx.read_config()?;
    ctx.vdisk_free(&cfg, &volume)?;
    Ok(())
}

#[api(
    input: {
        properties: {
            volume: {
                schema: VOLUME_ID_SCHEMA,
            },
        },
    },
)]
/// Get filesystem path for specified volume.
fn path(volume: String) -> Result<(), Error> {
    let ctx = storage_context();
    let (cfg, _digest) = ctx.read_config()?;
    let path = ctx.path(&cfg, &volume, None)?;
    println!("{}", path.path);
    Ok(())
}

#[api(
    input: {
        properties: {
            storage: {
                schema: STORAGE_ID_SCHEMA,
            },
            keep: {
                type: KeepOptions,
                flatten: true,
            },
            vmid: {
                schema: VMID_SCHEMA,
                optional: true,
            },
            "type": {
                schema: GUEST_TYPE_SCHEMA,
                optional: true,
            },
            "dry-run": {
                type: bool,
                description: "Only show what would be pruned, don't delete anything.",
                optional: true,
                default: false,
            },
            "output-format": {
                schema: OUTPUT_FORMAT,
                optional: true,
            },
        },
    },
)]
/// Prune backups. Only those using the standard naming scheme are considered.
fn prune_backups(
    storage: String,
    keep: KeepOptions,
    vmid: Option<u32>,
    param: Value,
) -> Result<(), Error> {
    let output_format = get_output_format(&param);
    let dry_run = param["dry-run"].as_bool().unwrap_or(false);
    let guest_type = param["type"].as_str();

    let ctx = storage_context();
    let (cfg, _digest) = ctx.read_config()?;
    let task = LogTaskContext::new(format!("prune {}", storage));

    let list = ctx.prune_backups(&cfg, &storage, vmid, guest_type, &keep, dry_run, &task)?;

    let mut data = serde_json::to_value(list)?;
    let options = default_table_format_options()
        .sortby("ctime", true)
        .column(ColumnConfig::new("volid"))
        .column(ColumnConfig::new("type"))
        .column(ColumnConfig::new("vmid"))
        .column(ColumnConfig::new("ctime"))
        .column(ColumnConfig::new("mark"));

    let return_type = ReturnType::new(false, &PRUNE_LIST_SCHEMA);
    format_and_print_result_full(&mut data, &return_type, &output_format, &options);

    Ok(())
}

fn main() {
    init_cli_logger("PVE_STORAGE_LOG", "info");

    let cmd_def = CliCommandMap::new()
        .insert("add", CliCommand::new(&API_METHOD_ADD).arg_param(&["type", "storage"]))
        .insert(
            "set",
            CliCommand::new(&API_METHOD_SET)
                .arg_param(&["storage"])
                .completion_cb("storage", complete_storage_name),
        )
        .insert(
            "remove",
            CliCommand::new(&API_METHOD_REMOVE)
                .arg_param(&["storage"])
                .completion_cb("storage", complete_storage_name),
        )
        .insert("status", CliCommand::new(&API_METHOD_STATUS))
        .insert(
            "list",
            CliCommand::new(&API_METHOD_LIST)
                .arg_param(&["storage"])
                .completion_cb("storage", complete_storage_name),
        )
        .insert(
            "alloc",
            CliCommand::new(&API_METHOD_ALLOC)
                .arg_param(&["storage", "vmid", "filename", "size"])
                .completion_cb("storage", complete_storage_name),
        )
        .insert("free", CliCommand::new(&API_METHOD_FREE).arg_param(&["volume"]))
        .insert("path", CliCommand::new(&API_METHOD_PATH).arg_param(&["volume"]))
        .insert(
            "prune-backups",
            CliCommand::new(&API_METHOD_PRUNE_BACKUPS)
                .arg_param(&["storage"])
                .completion_cb("storage", complete_storage_name),
        );

    let rpcenv = CliEnvironment::new();
    run_cli_command(cmd_def, rpcenv, None);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size_kib("1048576").unwrap(), 1048576);
        assert_eq!(parse_size_kib("4M").unwrap(), 4096);
        assert_eq!(parse_size_kib("2G").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size_kib("16K").unwrap(), 16);
        assert!(parse_size_kib("0").is_err());
        assert!(parse_size_kib("1T").is_err());
        assert!(parse_size_kib("").is_err());
    }
}
