// Probing and boot loading against a module tree on disk

use kmod_loader::{
    BootError, BootLoader, CmdLine, DeleteFlags, InitFlags, KmodConfig, ModState, ModuleLoader,
    ProbeError, ProbeOpts, Prober, ResolveError,
};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const RELEASE: &str = "6.8.0-test";

const MODULES_DEP: &str = "\
kernel/fs/xfs/xfs.ko: kernel/lib/libcrc32c.ko
kernel/lib/libcrc32c.ko:
kernel/fs/broken/broken.ko: kernel/lib/libcrc32c.ko
kernel/drivers/net/dummy.ko.zst:
kernel/sound/pci/hda/snd-hda-intel.ko: kernel/sound/pci/hda/snd-hda-codec.ko kernel/sound/core/snd.ko
kernel/sound/pci/hda/snd-hda-codec.ko: kernel/sound/core/snd.ko
kernel/sound/core/snd.ko: kernel/sound/soundcore.ko
kernel/sound/soundcore.ko:
";

const MODULES_BUILTIN: &str = "kernel/sound/soundcore.ko\nkernel/crypto/crc32c_generic.ko\n";

const PROC_MODULES: &str = "libcrc32c 16384 1 xfs, Live 0x0000000000000000\n\
                            nf_tables 344064 0 - Live 0x0000000000000000\n";

/// Records loads by image contents; the fixture writes each module's name
/// into its file.
#[derive(Default)]
struct Recorder {
    loaded: Vec<(String, String)>,
    removed: Vec<String>,
    errors: HashMap<String, i32>,
}

impl Recorder {
    fn failing(image: &str, errno: i32) -> Self {
        let mut recorder = Self::default();
        recorder.errors.insert(image.to_string(), errno);
        recorder
    }

    fn record(&mut self, image: String, params: &str) -> io::Result<()> {
        if let Some(errno) = self.errors.get(&image) {
            return Err(io::Error::from_raw_os_error(*errno));
        }
        self.loaded.push((image, params.to_string()));
        Ok(())
    }

    fn images(&self) -> Vec<&str> {
        self.loaded.iter().map(|(image, _)| image.as_str()).collect()
    }
}

impl ModuleLoader for Recorder {
    fn init(&mut self, image: &[u8], params: &str) -> io::Result<()> {
        self.record(String::from_utf8_lossy(image).into_owned(), params)
    }

    fn finit(&mut self, mut file: &File, params: &str, _flags: InitFlags) -> io::Result<()> {
        let mut image = String::new();
        file.read_to_string(&mut image)?;
        self.record(image, params)
    }

    fn delete(&mut self, name: &str, _flags: DeleteFlags) -> io::Result<()> {
        self.removed.push(name.to_string());
        Ok(())
    }
}

struct Fixture {
    root: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("lib/modules").join(RELEASE);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("modules.dep"), MODULES_DEP).unwrap();
        fs::write(dir.join("modules.builtin"), MODULES_BUILTIN).unwrap();

        for line in MODULES_DEP.lines() {
            let (path, _) = line.split_once(':').unwrap();
            let file = dir.join(path);
            fs::create_dir_all(file.parent().unwrap()).unwrap();

            let name = kmod_depfile::module_name(path);
            let image = if name == "broken" { "bad" } else { name };
            if path.ends_with(".zst") {
                fs::write(&file, zstd::stream::encode_all(image.as_bytes(), 0).unwrap()).unwrap();
            } else {
                fs::write(&file, image).unwrap();
            }
        }

        fs::create_dir_all(root.path().join("proc")).unwrap();
        fs::write(root.path().join("proc/modules"), PROC_MODULES).unwrap();

        Self { root }
    }

    fn path(&self) -> &Path {
        self.root.path()
    }

    fn module(&self, path: &str) -> PathBuf {
        self.path().join("lib/modules").join(RELEASE).join(path)
    }

    fn opts(&self) -> ProbeOpts {
        ProbeOpts {
            root_dir: self.path().to_path_buf(),
            kernel_release: Some(RELEASE.to_string()),
            proc_modules: self.path().join("proc/modules"),
            ..Default::default()
        }
    }

    fn fresh_opts(&self) -> ProbeOpts {
        ProbeOpts {
            ignore_proc_modules: true,
            ..self.opts()
        }
    }
}

fn prober(recorder: Recorder) -> Prober<Recorder> {
    Prober::new(recorder)
}

#[test]
fn test_probe_loads_dependencies_first() {
    let fixture = Fixture::new();
    let mut prober = prober(Recorder::default());

    let order = prober
        .probe("snd-hda-intel", "model=auto", &fixture.fresh_opts())
        .unwrap();

    assert_eq!(
        order,
        vec![
            fixture.module("kernel/sound/core/snd.ko"),
            fixture.module("kernel/sound/pci/hda/snd-hda-codec.ko"),
            fixture.module("kernel/sound/pci/hda/snd-hda-intel.ko"),
        ]
    );
    assert_eq!(
        prober.loader().loaded,
        vec![
            ("snd".to_string(), String::new()),
            ("snd-hda-codec".to_string(), String::new()),
            ("snd-hda-intel".to_string(), "model=auto".to_string()),
        ]
    );
}

#[test]
fn test_probe_by_underscore_name() {
    let fixture = Fixture::new();
    let mut prober = prober(Recorder::default());

    prober
        .probe("snd_hda_codec", "", &fixture.fresh_opts())
        .unwrap();
    assert_eq!(prober.loader().images(), vec!["snd", "snd-hda-codec"]);
}

#[test]
fn test_loaded_modules_are_skipped() {
    let fixture = Fixture::new();
    let mut prober = prober(Recorder::default());

    let order = prober.probe("xfs", "", &fixture.opts()).unwrap();
    assert_eq!(order, vec![fixture.module("kernel/fs/xfs/xfs.ko")]);
    assert_eq!(prober.loader().images(), vec!["xfs"]);

    let order = prober.probe("libcrc32c", "", &fixture.opts()).unwrap();
    assert!(order.is_empty());
    assert_eq!(prober.loader().images(), vec!["xfs"]);
}

#[test]
fn test_builtin_module_needs_no_load() {
    let fixture = Fixture::new();
    let mut prober = prober(Recorder::default());

    assert!(prober
        .probe("soundcore", "", &fixture.fresh_opts())
        .unwrap()
        .is_empty());
    assert!(prober
        .probe("crc32c_generic", "", &fixture.fresh_opts())
        .unwrap()
        .is_empty());
    assert!(prober.loader().loaded.is_empty());
}

#[test]
fn test_dry_run_loads_nothing() {
    let fixture = Fixture::new();
    let mut prober = prober(Recorder::default());

    let opts = ProbeOpts {
        dry_run: true,
        ..fixture.fresh_opts()
    };
    let order = prober.probe("xfs", "", &opts).unwrap();

    assert_eq!(
        order,
        vec![
            fixture.module("kernel/lib/libcrc32c.ko"),
            fixture.module("kernel/fs/xfs/xfs.ko"),
        ]
    );
    assert!(prober.loader().loaded.is_empty());
}

#[test]
fn test_already_present_module_counts_as_loaded() {
    let fixture = Fixture::new();
    let mut prober = prober(Recorder::failing("libcrc32c", libc::EEXIST));

    let order = prober.probe("xfs", "", &fixture.fresh_opts()).unwrap();
    assert_eq!(order.len(), 2);
    assert_eq!(prober.loader().images(), vec!["xfs"]);
}

#[test]
fn test_failure_stops_the_sequence() {
    let fixture = Fixture::new();
    let mut prober = prober(Recorder::failing("bad", libc::ENOEXEC));

    let mut deps = prober.dependency_map(&fixture.fresh_opts()).unwrap();
    let err = prober.probe_in(&mut deps, "broken", "", false).unwrap_err();

    match err {
        ProbeError::Load { path, source } => {
            assert_eq!(path, fixture.module("kernel/fs/broken/broken.ko"));
            assert_eq!(source.raw_os_error(), Some(libc::ENOEXEC));
        }
        other => panic!("unexpected error: {other}"),
    }

    // Dependencies loaded before the failure stay loaded
    assert_eq!(prober.loader().images(), vec!["libcrc32c"]);
    assert_eq!(
        deps.state(&fixture.module("kernel/lib/libcrc32c.ko")),
        Some(ModState::Loaded)
    );
    assert_eq!(
        deps.state(&fixture.module("kernel/fs/broken/broken.ko")),
        Some(ModState::Unloaded)
    );
}

#[test]
fn test_dependency_failure_skips_target() {
    let fixture = Fixture::new();
    let mut prober = prober(Recorder::failing("libcrc32c", libc::ENOMEM));

    let err = prober.probe("xfs", "", &fixture.fresh_opts()).unwrap_err();
    assert!(matches!(err, ProbeError::Load { ref path, .. } if *path == fixture.module("kernel/lib/libcrc32c.ko")));
    assert!(prober.loader().loaded.is_empty());
}

#[test]
fn test_compressed_module() {
    let fixture = Fixture::new();
    let mut prober = prober(Recorder::default());

    prober.probe("dummy", "numdummies=2", &fixture.fresh_opts()).unwrap();
    assert_eq!(
        prober.loader().loaded,
        vec![("dummy".to_string(), "numdummies=2".to_string())]
    );
}

#[test]
fn test_unknown_module() {
    let fixture = Fixture::new();
    let mut prober = prober(Recorder::default());

    let err = prober.probe("btrfs", "", &fixture.opts()).unwrap_err();
    assert!(matches!(
        err,
        ProbeError::Resolve(ResolveError::ModuleNotFound(ref name)) if name == "btrfs"
    ));
}

#[test]
fn test_missing_dep_file() {
    let fixture = Fixture::new();
    let prober = prober(Recorder::default());

    let opts = ProbeOpts {
        kernel_release: Some("5.0.0-missing".to_string()),
        ..fixture.opts()
    };
    assert!(matches!(
        prober.dependency_map(&opts),
        Err(ProbeError::DepFile { .. })
    ));
}

#[test]
fn test_missing_proc_modules_is_ignored() {
    let fixture = Fixture::new();
    let mut prober = prober(Recorder::default());

    let opts = ProbeOpts {
        proc_modules: fixture.path().join("proc/nonexistent"),
        ..fixture.opts()
    };
    prober.probe("xfs", "", &opts).unwrap();
    assert_eq!(prober.loader().images(), vec!["libcrc32c", "xfs"]);
}

#[test]
fn test_insmod_and_rmmod() {
    let fixture = Fixture::new();
    let mut prober = prober(Recorder::default());

    prober
        .insmod(
            &fixture.module("kernel/fs/xfs/xfs.ko"),
            "",
            InitFlags::IGNORE_VERMAGIC,
        )
        .unwrap();
    prober
        .rmmod("kernel/sound/pci/hda/snd-hda-intel.ko", DeleteFlags::NONBLOCK)
        .unwrap();
    prober.rmmod("xfs", DeleteFlags::NONBLOCK).unwrap();

    assert_eq!(prober.loader().images(), vec!["xfs"]);
    assert_eq!(prober.loader().removed, vec!["snd_hda_intel", "xfs"]);
}

#[test]
fn test_boot_loader_reuses_state_between_probes() {
    let fixture = Fixture::new();
    let cmdline = CmdLine::parse("quiet snd-hda-intel.model=auto");
    let mut boot = BootLoader::new(Recorder::default(), cmdline, fixture.fresh_opts());

    assert_eq!(boot.load_module("snd_hda_intel").unwrap().len(), 3);
    assert!(boot.load_module("snd-hda-intel").unwrap().is_empty());
    assert_eq!(boot.load_module("snd-hda-codec").unwrap().len(), 0);

    assert_eq!(
        boot.prober().loader().loaded.last(),
        Some(&("snd-hda-intel".to_string(), "model=auto".to_string()))
    );
}

#[test]
fn test_install_all() {
    let fixture = Fixture::new();

    let boot_dir = fixture.path().join("boot-modules");
    fs::create_dir_all(&boot_dir).unwrap();
    fs::write(boot_dir.join("e1000e.ko"), "e1000e").unwrap();
    fs::write(boot_dir.join("idpf.ko"), "idpf").unwrap();

    let conf_dir = fixture.path().join("modules-load.d");
    fs::create_dir_all(&conf_dir).unwrap();
    fs::write(conf_dir.join("sound.conf"), "# sound\nsnd-hda-intel\nidpf_imc\n").unwrap();

    let config = KmodConfig {
        root_dir: fixture.path().to_path_buf(),
        kernel_release: Some(RELEASE.to_string()),
        ignore_proc_modules: true,
        boot_modules_glob: format!("{}/*.ko", boot_dir.display()),
        modules_load_glob: format!("{}/*.conf", conf_dir.display()),
        ..Default::default()
    };

    let cmdline = CmdLine::parse("modules_load=xfs,btrfs e1000e.debug=1 snd_hda_intel.model=auto");
    let mut boot = BootLoader::new(Recorder::default(), cmdline, config.probe_opts())
        .with_excluded(&config.excluded_modules);
    boot.install_all(&config).unwrap();

    let recorder = boot.into_prober().into_inner();
    assert_eq!(
        recorder.loaded,
        vec![
            ("e1000e".to_string(), "debug=1".to_string()),
            ("snd".to_string(), String::new()),
            ("snd-hda-codec".to_string(), String::new()),
            ("snd-hda-intel".to_string(), "model=auto".to_string()),
            ("libcrc32c".to_string(), String::new()),
            ("xfs".to_string(), String::new()),
        ]
    );
}

#[test]
fn test_install_all_without_boot_modules() {
    let fixture = Fixture::new();

    let config = KmodConfig {
        root_dir: fixture.path().to_path_buf(),
        kernel_release: Some(RELEASE.to_string()),
        ignore_proc_modules: true,
        boot_modules_glob: format!("{}/none/*.ko", fixture.path().display()),
        modules_load_glob: format!("{}/none/*.conf", fixture.path().display()),
        ..Default::default()
    };

    let mut boot = BootLoader::new(
        Recorder::default(),
        CmdLine::parse("modules_load=dummy"),
        config.probe_opts(),
    );
    boot.install_all(&config).unwrap();
    assert_eq!(boot.prober().loader().images(), vec!["dummy"]);
}

#[test]
fn test_install_all_rejects_bad_pattern() {
    let fixture = Fixture::new();
    let config = KmodConfig {
        boot_modules_glob: "[".to_string(),
        ..Default::default()
    };

    let mut boot = BootLoader::new(Recorder::default(), CmdLine::default(), fixture.opts());
    assert!(matches!(
        boot.install_all(&config),
        Err(BootError::Pattern { .. })
    ));
}
