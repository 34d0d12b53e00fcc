//! Manage images and run containers backed by them.
use std::path::PathBuf;

use anyhow::{Context, Result};
use caps::Capability;
use clap::{Parser, Subcommand};
use libcapsule::config::{
    BundleSpec, CapabilitySets, CgroupResources, ContainerConfig, Mount, NamespaceType,
    Namespaces, Root, SpecLinux, SpecProcess,
};
use libcapsule::image::ImageService;
use libcapsule::network::PortMapping;

use super::{load_factory, new_process, reclaim_after_error};

#[derive(Subcommand, Debug)]
pub enum Image {
    Create(ImageCreate),
    Delete(ImageDelete),
    List(ImageList),
    Run(ImageRun),
}

/// Register an image from a rootfs tarball
#[derive(Parser, Debug)]
pub struct ImageCreate {
    #[arg(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub image_id: String,
    /// Path to the rootfs tarball
    #[arg(required = true)]
    pub tarball: PathBuf,
}

/// Delete an image and its read-only layer
#[derive(Parser, Debug)]
pub struct ImageDelete {
    #[arg(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub image_id: String,
}

/// List images
#[derive(Parser, Debug)]
pub struct ImageList {}

/// Run a container on top of an image
#[derive(Parser, Debug)]
pub struct ImageRun {
    #[arg(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub image_id: String,
    #[arg(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_id: String,
    /// Command to run inside the container
    #[arg(required = true, trailing_var_arg = true)]
    pub command: Vec<String>,
    /// Environment variables as KEY=VAL (repeatable)
    #[arg(short, long)]
    pub env: Vec<String>,
    /// Working directory inside the container
    #[arg(long, default_value = "/")]
    pub cwd: PathBuf,
    /// Leave the container running in the background
    #[arg(short, long)]
    pub detach: bool,
    /// Attach the container to this network
    #[arg(long)]
    pub network: Option<String>,
    /// Publish a container port as host:container (repeatable)
    #[arg(short = 'p', long = "publish")]
    pub port_mappings: Vec<PortMapping>,
    /// CPU shares for the container cgroup
    #[arg(long)]
    pub cpu_shares: Option<u64>,
    /// Memory limit in bytes
    #[arg(long)]
    pub memory: Option<i64>,
}

pub fn image(args: Image, root: PathBuf) -> Result<i32> {
    let service = ImageService::new(&root).context("failed to open image store")?;
    match args {
        Image::Create(args) => {
            service
                .create(&args.image_id, &args.tarball)
                .with_context(|| format!("failed to create image {}", args.image_id))?;
            Ok(0)
        }
        Image::Delete(args) => {
            service
                .delete(&args.image_id)
                .with_context(|| format!("failed to delete image {}", args.image_id))?;
            Ok(0)
        }
        Image::List(_) => {
            for image in service.list()? {
                println!(
                    "{}\t{}\t{}\t{}",
                    image.id,
                    image.layer_id,
                    image.created.to_rfc3339_opts(chrono::SecondsFormat::Secs, false),
                    image.size
                );
            }
            Ok(0)
        }
        Image::Run(args) => image_run(&service, args, root),
    }
}

fn image_run(service: &ImageService, args: ImageRun, root: PathBuf) -> Result<i32> {
    let factory = load_factory(&root)?;
    if factory.exists(&args.container_id) {
        anyhow::bail!("container {} already exists", args.container_id);
    }

    let rootfs = service
        .prepare_container_rootfs(&args.container_id, &args.image_id)
        .with_context(|| format!("failed to prepare rootfs from image {}", args.image_id))?;

    let result = run_on_rootfs(service, &factory, &args, rootfs);
    match result {
        Ok(exit_code) => {
            if !args.detach {
                service.destroy_container(&args.container_id);
            }
            Ok(exit_code)
        }
        Err(err) => {
            tracing::warn!(container_id = %args.container_id, "run failed, reclaiming layers");
            service.destroy_container(&args.container_id);
            Err(err)
        }
    }
}

fn run_on_rootfs(
    service: &ImageService,
    factory: &libcapsule::factory::CapsuleFactory,
    args: &ImageRun,
    rootfs: PathBuf,
) -> Result<i32> {
    let spec = build_spec(args, rootfs);
    let bundle = service.write_bundle_spec(&args.container_id, &spec)?;
    let config = ContainerConfig::from_spec(&spec, &bundle)?;

    let mut container = factory.create(&args.container_id, config)?;
    if let Err(err) = container.run(new_process(&spec, args.detach)) {
        reclaim_after_error(&mut container);
        return Err(err)
            .with_context(|| format!("failed to run container {}", args.container_id));
    }

    if let Some(network) = &args.network {
        if let Err(err) = container.connect_network(network, args.port_mappings.clone()) {
            reclaim_after_error(&mut container);
            return Err(err)
                .with_context(|| format!("failed to connect container to network {network}"));
        }
    }

    if args.detach {
        return Ok(0);
    }
    let exit_code = container.wait()?;
    container.destroy()?;
    Ok(exit_code)
}

// The spec an image-backed container runs with: all five namespaces, a
// proc mount, and the usual unprivileged-but-useful capability set.
fn build_spec(args: &ImageRun, rootfs: PathBuf) -> BundleSpec {
    let default_caps = vec![
        Capability::CAP_AUDIT_WRITE,
        Capability::CAP_CHOWN,
        Capability::CAP_DAC_OVERRIDE,
        Capability::CAP_FOWNER,
        Capability::CAP_FSETID,
        Capability::CAP_KILL,
        Capability::CAP_MKNOD,
        Capability::CAP_NET_BIND_SERVICE,
        Capability::CAP_NET_RAW,
        Capability::CAP_SETFCAP,
        Capability::CAP_SETGID,
        Capability::CAP_SETPCAP,
        Capability::CAP_SETUID,
        Capability::CAP_SYS_CHROOT,
    ];

    BundleSpec {
        hostname: Some(args.container_id.clone()),
        root: Root { path: rootfs },
        process: SpecProcess {
            args: args.command.clone(),
            env: args.env.clone(),
            cwd: args.cwd.clone(),
            no_new_privileges: false,
        },
        mounts: vec![Mount {
            source: Some(PathBuf::from("proc")),
            destination: PathBuf::from("/proc"),
            fs_type: Some("proc".to_owned()),
            options: vec!["nosuid".to_owned(), "noexec".to_owned(), "nodev".to_owned()],
        }],
        linux: SpecLinux {
            namespaces: Namespaces::new(vec![
                NamespaceType::Pid,
                NamespaceType::Net,
                NamespaceType::Ipc,
                NamespaceType::Uts,
                NamespaceType::Mount,
            ]),
            capabilities: CapabilitySets {
                bounding: default_caps.clone(),
                effective: default_caps.clone(),
                inheritable: Vec::new(),
                permitted: default_caps,
                ambient: Vec::new(),
            },
            rlimits: Vec::new(),
            resources: CgroupResources {
                cpu_shares: args.cpu_shares,
                memory_limit: args.memory,
                pids_limit: None,
            },
        },
        annotations: Default::default(),
    }
}
