use nufs::io::FileBlockEmulatorBuilder;
use nufs::Nufs;

pub fn main() {
    let tmp = tempfile::tempfile().unwrap();
    let dev = FileBlockEmulatorBuilder::from(tmp)
        .with_block_count(64)
        .build()
        .expect("Could not initialize disk emulator.");

    // create a new fs on the device and put a file in a subdirectory
    let mut fs = Nufs::create(dev).expect("should create");
    fs.create_directory("/etc").unwrap();
    fs.write("/etc/motd", b"hello from nufs\n", 0).unwrap();

    for entry in fs.read_dir("/etc").unwrap() {
        println!("{:>4} {:o} {}", entry.attr.inum, entry.attr.mode, entry.name);
    }
    println!("{:?}", fs.statfs());
}
