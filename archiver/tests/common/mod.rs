//! Fake host tools for driving the system backends end to end.
//!
//! Each script records its invocation in `state/calls` and keeps whatever it
//! pretends to have done (attached loop, key, filesystem, mounts) as marker
//! files under `state/`.

#![allow(dead_code)]

use archiver::Config;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const SEED: &str = "integration-seed";

pub fn write_executable(path: &Path, body: &str) {
    fs::write(path, body).unwrap();
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}

pub struct FakeTools {
    pub temp_dir: TempDir,
}

impl FakeTools {
    pub fn install() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        for dir in ["bin", "state", "mapper", "mnt", "photos/2024"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        fs::write(root.join("photos/2024/beach.jpg"), b"jpeg bytes").unwrap();
        fs::write(root.join("photos/notes.txt"), b"holiday").unwrap();

        let tools = Self { temp_dir };
        tools.write_scripts();
        tools
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn state(&self) -> PathBuf {
        self.root().join("state")
    }

    pub fn bin(&self, tool: &str) -> PathBuf {
        self.root().join("bin").join(tool)
    }

    pub fn container(&self) -> PathBuf {
        self.root().join("containers/photos")
    }

    pub fn mount_point(&self) -> PathBuf {
        self.root().join("mnt/photos")
    }

    pub fn mapped_node(&self) -> PathBuf {
        self.root().join("mapper/photos")
    }

    /// Make the next synchronization hang until it is killed.
    pub fn stall_sync(&self) {
        fs::write(self.state().join("rsync.stall"), b"").unwrap();
    }

    /// Make synchronization exit with the given status.
    pub fn fail_sync(&self, code: i32) {
        fs::write(self.state().join("rsync.exit"), code.to_string()).unwrap();
    }

    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.state().join("calls"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn calls_to(&self, tool: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.split_whitespace().next() == Some(tool))
            .collect()
    }

    pub fn clear_calls(&self) {
        let _ = fs::remove_file(self.state().join("calls"));
    }

    pub fn stored_key(&self) -> Option<String> {
        fs::read_to_string(self.state().join("key")).ok()
    }

    pub fn loop_attached(&self) -> bool {
        self.state().join("loop0").exists()
    }

    pub fn config_text(&self) -> String {
        let root = self.root().display();
        let bin = self.root().join("bin");
        let bin = bin.display();
        format!(
            r#"
[backup]
container_dir = "{root}/containers"
mount_dir = "{root}/mnt"
password_seed = "{SEED}"
archives = ["{root}/photos"]

[sync]
bandwidth_limit_kbps = 0
max_delete = 25

[tools]
losetup = "{bin}/losetup"
cryptsetup = "{bin}/cryptsetup"
e2fsck = "{bin}/e2fsck"
mkfs = "{bin}/mkfs.ext4"
mount = "{bin}/mount"
umount = "{bin}/umount"
mountpoint = "{bin}/mountpoint"
rsync = "{bin}/rsync"
mapper_dir = "{root}/mapper"

[log]
level = "debug"
"#
        )
    }

    pub fn config(&self) -> Config {
        let config = Config::from_toml_str(&self.config_text()).unwrap();
        config.validate().unwrap();
        config
    }

    pub fn write_config(&self) -> PathBuf {
        let path = self.root().join("archiver.toml");
        fs::write(&path, self.config_text()).unwrap();
        path
    }

    fn write_scripts(&self) {
        let state = self.state();
        let mapper = self.root().join("mapper");
        let header = |tool: &str| {
            format!(
                "#!/bin/sh\nSTATE='{}'\nMAPPER='{}'\necho \"{} $*\" >> \"$STATE/calls\"\n",
                state.display(),
                mapper.display(),
                tool
            )
        };

        write_executable(
            &self.bin("losetup"),
            &format!(
                r#"{}
for last; do :; done
case "$1" in
  --list)
    if [ -f "$STATE/loop0" ] && [ "$(cat "$STATE/loop0")" = "$last" ]; then
      printf '{{"loopdevices": [{{"name": "/dev/loop0"}}]}}\n'
    fi
    ;;
  --find)
    printf '%s' "$last" > "$STATE/loop0"
    echo /dev/loop0
    ;;
  --detach)
    if [ ! -f "$STATE/loop0" ]; then
      echo "losetup: $last: detach failed: No such device or address" >&2
      exit 1
    fi
    rm -f "$STATE/loop0"
    ;;
esac
"#,
                header("losetup")
            ),
        );

        write_executable(
            &self.bin("cryptsetup"),
            &format!(
                r#"{}
for last; do :; done
case "$1" in
  luksFormat)
    cat > "$STATE/key"
    printf 'LUKS\272\276\000\001' | dd of="$(cat "$STATE/loop0")" conv=notrunc 2>/dev/null
    ;;
  open)
    key=$(cat)
    if [ ! -f "$STATE/key" ] || [ "$key" != "$(cat "$STATE/key")" ]; then
      echo "No key available with this passphrase." >&2
      exit 2
    fi
    if [ "$2" != "--test-passphrase" ]; then
      touch "$MAPPER/$last"
    fi
    ;;
  close)
    rm -f "$MAPPER/$last"
    ;;
esac
"#,
                header("cryptsetup")
            ),
        );

        write_executable(
            &self.bin("e2fsck"),
            &format!(
                r#"{}
if [ -f "$STATE/fs" ]; then
  exit 0
fi
echo "e2fsck: Bad magic number in super-block" >&2
exit 8
"#,
                header("e2fsck")
            ),
        );

        write_executable(
            &self.bin("mkfs.ext4"),
            &format!(
                "{}\necho \"Writing superblocks\"\ntouch \"$STATE/fs\"\n",
                header("mkfs.ext4")
            ),
        );

        write_executable(
            &self.bin("mountpoint"),
            &format!(
                "{}\nfor dir; do :; done\n[ -f \"$dir/.mounted\" ]\n",
                header("mountpoint")
            ),
        );

        write_executable(
            &self.bin("mount"),
            &format!(
                "{}\nfor dir; do :; done\ntouch \"$dir/.mounted\"\n",
                header("mount")
            ),
        );

        write_executable(
            &self.bin("umount"),
            &format!(
                "{}\nfor dir; do :; done\nrm -f \"$dir/.mounted\"\n",
                header("umount")
            ),
        );

        write_executable(
            &self.bin("rsync"),
            &format!(
                r#"{}
prev=
for arg; do src=$prev; prev=$arg; done
if [ -f "$STATE/rsync.stall" ]; then
  exec sleep 30
fi
if [ -f "$STATE/rsync.exit" ]; then
  echo "rsync error: some files could not be transferred" >&2
  exit "$(cat "$STATE/rsync.exit")"
fi
mkdir -p "$STATE/synced"
cp -R "$src" "$STATE/synced/"
echo "sent 17 bytes  received 35 bytes"
"#,
                header("rsync")
            ),
        );
    }
}
