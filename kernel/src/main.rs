// Bootable kernel image. Everything lives in the library; linking it pulls
// in the boot shim, the trap vector, and the panic handler.

#![no_std]
#![no_main]

use kernel as _;
