use std::os::unix::net::UnixDatagram;
use std::os::unix::fs::PermissionsExt;
use tempfile::tempdir;

#[test]
fn perm_check() {
    let dir = tempdir().unwrap();
    let p = dir.path().join("c.sock");
    let s = UnixDatagram::bind(&p).unwrap();
    let md = std::fs::metadata(&p).unwrap();
    println!("mode: {:o}", md.permissions().mode());
    let server = dir.path().join("server.sock");
    let _server_sock = UnixDatagram::bind(&server).unwrap();
    s.connect(&server).unwrap();

    let reply = UnixDatagram::unbound().unwrap();
    match reply.connect(&p) {
        Ok(_) => println!("ok"),
        Err(e) => println!("err {:?}", e),
    }
}
