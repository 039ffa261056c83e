use imagerpi_core::command::{CommandOutput, CommandRunner};
use imagerpi_core::pipeline::{self, CaptureOptions, DeployOptions, Outcome};
use std::cell::RefCell;
use std::io;
use std::path::Path;

const SECTOR: u64 = 512;

/// Plays the part of sfdisk, blkid and e2fsprogs for a small fake card.
///
/// The card has a 2048-sector partition followed by an ext4 partition of
/// 6144 sectors (3 MiB), holding 768 4 KiB blocks of which 200 are needed.
struct FakeCard {
    node_prefix: String,
    calls: RefCell<Vec<String>>,
}

impl FakeCard {
    fn new(device: &Path) -> Self {
        Self {
            node_prefix: device.display().to_string(),
            calls: RefCell::new(Vec::new()),
        }
    }

    fn ok(stdout: String) -> io::Result<CommandOutput> {
        Ok(CommandOutput {
            status: Some(0),
            stdout,
            stderr: String::new(),
        })
    }
}

impl CommandRunner for FakeCard {
    fn run(&self, program: &str, args: &[&str], _input: Option<&str>) -> io::Result<CommandOutput> {
        self.calls
            .borrow_mut()
            .push(format!("{} {}", program, args.join(" ")));
        let p = &self.node_prefix;
        match (program, args) {
            ("sfdisk", ["--json", _]) => Self::ok(format!(
                r#"{{"partitiontable": {{"label": "dos", "sectorsize": 512, "partitions": [
                    {{"node": "{p}1", "start": 2048, "size": 2048}},
                    {{"node": "{p}2", "start": 4096, "size": 6144}}
                ]}}}}"#
            )),
            ("blkid", [.., node]) if node.ends_with('1') => Self::ok("vfat\n".into()),
            ("blkid", _) => Self::ok("ext4\n".into()),
            ("resize2fs", ["-P", _]) => {
                Self::ok("Estimated minimum size of the filesystem: 200\n".into())
            }
            ("dumpe2fs", _) => Self::ok("Block count:              768\nBlock size:               4096\n".into()),
            ("e2fsck", _) | ("resize2fs", _) | ("sfdisk", _) => Self::ok(String::new()),
            _ => Err(io::Error::new(io::ErrorKind::NotFound, program.to_string())),
        }
    }
}

fn card_contents() -> Vec<u8> {
    (0..(12_288 * SECTOR) as usize)
        .map(|i| (i * 7 % 255) as u8)
        .collect()
}

#[test]
fn captured_image_deploys_back_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let card = dir.path().join("card");
    let image = dir.path().join("card.img");
    let target = dir.path().join("target");
    let contents = card_contents();
    std::fs::write(&card, &contents).unwrap();
    std::fs::write(&target, vec![0u8; contents.len()]).unwrap();

    let runner = FakeCard::new(&card);
    let options = CaptureOptions {
        shrink: false,
        buffer_size: 64 * 1024,
        verify: true,
        ..CaptureOptions::default()
    };
    let captured = pipeline::capture(&runner, &card, &image, &options, |_| Ok(true), pipeline::silent())
        .unwrap();
    let end = (4096 + 6144) * SECTOR;
    assert_eq!(captured, Outcome::Completed { bytes: end });

    let deployed = pipeline::deploy(
        &image,
        &target,
        &DeployOptions {
            buffer_size: 1000,
            verify: true,
        },
        pipeline::silent(),
    )
    .unwrap();
    assert_eq!(deployed, Outcome::Completed { bytes: end });

    let written = std::fs::read(&target).unwrap();
    assert_eq!(&written[..end as usize], &contents[..end as usize]);
}

#[test]
fn shrunk_capture_stops_at_aligned_partition_end() {
    let dir = tempfile::tempdir().unwrap();
    let card = dir.path().join("card");
    let image = dir.path().join("card.img");
    let contents = card_contents();
    std::fs::write(&card, &contents).unwrap();

    let runner = FakeCard::new(&card);
    let options = CaptureOptions {
        min_free: 100 * 4096,
        buffer_size: 4096,
        ..CaptureOptions::default()
    };
    let outcome = pipeline::capture(&runner, &card, &image, &options, |_| Ok(true), pipeline::silent())
        .unwrap();

    // 300 blocks of 4 KiB need 2400 sectors, rounded up to a 1 MiB boundary.
    let end = (4096 + 4096) * SECTOR;
    assert_eq!(outcome, Outcome::Completed { bytes: end });
    assert_eq!(std::fs::read(&image).unwrap(), &contents[..end as usize]);

    let calls = runner.calls.borrow();
    assert!(calls.contains(&format!("resize2fs {}2 300", card.display())));
    assert!(calls.contains(&format!("sfdisk --no-reread -N 2 {}", card.display())));
}
