//! Shared station-config fixture for the crate's tests.

use std::fs;
use std::path::Path;

use board_config::Config;

pub fn write_config(root: &Path) -> Config {
    let device_dir = root.join("device");
    fs::create_dir_all(&device_dir).unwrap();
    fs::create_dir_all(root.join("mcu_firmware")).unwrap();

    fs::write(
        device_dir.join("board.json"),
        r#"{"cvm-a55": {"device": "j6e", "sdk": 930, "artifact_path": "Dev/Common/j6/bsp/daily/Release/930"}}"#,
    )
    .unwrap();
    fs::write(
        device_dir.join("device.json"),
        r#"{"hostname": "cvm-a55", "power_port": 3,
            "relay_intf": {"type": "corx", "server_addr": "192.168.3.133", "client_addr": "192.168.3.10"}}"#,
    )
    .unwrap();
    fs::write(
        device_dir.join("connect_param.json"),
        r#"{"serial": {"soc": {"port": "/dev/ttyUSB2", "baudrate": 921600},
                       "mcu": {"port": "/dev/ttyUSB3", "baudrate": 921600},
                       "hsm": {"port": "/dev/ttyUSB1", "baudrate": 921600}},
            "ssh": {"soc": {"name": "soc", "user": "root", "addr": "192.168.2.62"}}}"#,
    )
    .unwrap();
    fs::write(
        device_dir.join("uart_boot.json"),
        r#"{"uart_boot_methods": [{
            "loading_step": [
                {"uart_port": "mcu", "img_data": ["SBL.img"]},
                {"uart_port": "soc", "img_data": ["spl_uart.img"]}],
            "mcu_package": [{"device": "j6e", "sdk": "https://repo.example/mcu_sdk.zip"}]}]}"#,
    )
    .unwrap();
    fs::write(
        device_dir.join("state.json"),
        r#"{"prompts": {"uboot": ["=>\\s*"], "mcu": ["CCC"], "kernel": ["login:"]}}"#,
    )
    .unwrap();

    Config::load(root).unwrap()
}
