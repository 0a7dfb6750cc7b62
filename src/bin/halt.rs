//! Emergency stop.
//!
//! Sends the stop command to the sorting controller on the first port
//! that opens, without going through the main application.

use std::io::Write;
use std::time::Duration;

const PORTS: [&str; 11] = [
    "/dev/ttyACM0",
    "/dev/ttyACM1",
    "/dev/ttyACM2",
    "/dev/ttyACM3",
    "/dev/ttyUSB0",
    "/dev/ttyUSB1",
    "/dev/ttyUSB2",
    "/dev/ttyUSB3",
    "/dev/ttyAMA0",
    "/dev/ttyAMA1",
    "/dev/ttyAMA10",
];

fn main() {
    for name in PORTS {
        let port = serialport::new(name, 9600)
            .timeout(Duration::from_millis(500))
            .open();
        if let Ok(mut port) = port {
            match port.write_all(b"X").and_then(|_| port.flush()) {
                Ok(_) => {
                    println!("Stop sent on {}", name);
                    return;
                }
                Err(e) => eprintln!("Write failed on {}: {}", name, e),
            }
        }
    }
    eprintln!("No sorting controller found.");
    std::process::exit(1);
}
