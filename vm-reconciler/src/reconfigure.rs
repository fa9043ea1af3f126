// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Diffing of non-disk attributes into a single batched update.

use crate::client::AttributeChange;
use crate::client::UpdatePatch;
use crate::disk::DiskDescriptor;
use crate::disk::InterfaceKey;
use crate::errors::Error;
use crate::types::EntityAttributes;
use std::collections::BTreeMap;

/// The batched update for one pass, and whether the hypervisor needs a
/// reboot before all of it takes effect.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reconfiguration {
    pub patch: UpdatePatch,
    pub reboot_required: bool,
}

impl Reconfiguration {
    fn set(&mut self, change: AttributeChange, needs_reboot: bool) {
        self.patch.push(change);
        self.reboot_required |= needs_reboot;
    }
}

/// Compute the changes that take `observed` attributes to `desired`.
///
/// With `baseline` set every attribute is written whether or not it
/// differs; this normalizes a fresh clone, which inherits whatever its
/// source had. The reboot flag is always derived from real differences.
///
/// Disk QoS limits of disks present on both sides are included; they are
/// hot-applied.
pub fn diff(
    observed: &EntityAttributes,
    desired: &EntityAttributes,
    observed_disks: &BTreeMap<InterfaceKey, DiskDescriptor>,
    desired_disks: &BTreeMap<InterfaceKey, DiskDescriptor>,
    baseline: bool,
) -> Result<Reconfiguration, Error> {
    // As with disks, a device that exists remotely but is not declared is
    // never removed implicitly.
    if let Some(key) = observed
        .network_devices
        .keys()
        .find(|key| !desired.network_devices.contains_key(*key))
    {
        return Err(Error::DeviceDeletionUnsupported { key: key.clone() });
    }

    let mut out = Reconfiguration::default();

    if baseline || observed.name != desired.name {
        out.set(AttributeChange::Name(desired.name.clone()), false);
    }
    if baseline || observed.description != desired.description {
        out.set(
            AttributeChange::Description(desired.description.clone()),
            false,
        );
    }
    if baseline || observed.tags != desired.tags {
        out.set(AttributeChange::Tags(desired.tags.clone()), false);
    }
    if baseline || observed.on_boot != desired.on_boot {
        out.set(AttributeChange::OnBoot(desired.on_boot), false);
    }

    let (have, want) = (&observed.cpu, &desired.cpu);
    if baseline || have != want {
        let topology_changed = have.sockets != want.sockets
            || have.cores != want.cores
            || have.cpu_type != want.cpu_type;
        out.set(AttributeChange::Cpu(want.clone()), topology_changed);
    }

    let (have, want) = (&observed.memory, &desired.memory);
    if baseline || have != want {
        out.set(
            AttributeChange::Memory(want.clone()),
            have.dedicated_mib != want.dedicated_mib,
        );
    }

    if baseline || observed.bios != desired.bios {
        out.set(
            AttributeChange::Bios(desired.bios),
            observed.bios != desired.bios,
        );
    }
    if baseline || observed.machine != desired.machine {
        out.set(
            AttributeChange::Machine(desired.machine.clone()),
            observed.machine != desired.machine,
        );
    }
    if baseline || observed.boot_order != desired.boot_order {
        out.set(AttributeChange::BootOrder(desired.boot_order.clone()), false);
    }
    if baseline || observed.agent != desired.agent {
        out.set(
            AttributeChange::Agent(desired.agent.clone()),
            observed.agent != desired.agent,
        );
    }

    for (key, want) in &desired.network_devices {
        let have = observed.network_devices.get(key);
        match (have, want.enabled) {
            // Explicit removal.
            (Some(_), false) => out.set(
                AttributeChange::NetworkDevice { key: key.clone(), device: None },
                true,
            ),
            (None, false) => {}
            (None, true) => out.set(
                AttributeChange::NetworkDevice {
                    key: key.clone(),
                    device: Some(want.clone()),
                },
                true,
            ),
            (Some(have), true) => {
                if baseline || have != want {
                    out.set(
                        AttributeChange::NetworkDevice {
                            key: key.clone(),
                            device: Some(want.clone()),
                        },
                        false,
                    );
                }
            }
        }
    }

    if baseline || observed.serial_devices != desired.serial_devices {
        out.set(
            AttributeChange::SerialDevices(desired.serial_devices.clone()),
            observed.serial_devices != desired.serial_devices,
        );
    }
    if baseline || observed.audio_device != desired.audio_device {
        out.set(
            AttributeChange::Audio(desired.audio_device.clone()),
            observed.audio_device != desired.audio_device,
        );
    }

    let (have, want) = (&observed.cloud_init, &desired.cloud_init);
    if baseline || have != want {
        // Only adding, removing or relocating the drive needs a reboot; the
        // drive's contents are regenerated in place.
        let drive_changed = match (have, want) {
            (Some(have), Some(want)) => have.drive_differs(want),
            (None, None) => false,
            _ => true,
        };
        out.set(AttributeChange::CloudInit(want.clone()), drive_changed);
    }

    for (interface, want) in desired_disks {
        if let Some(have) = observed_disks.get(interface) {
            if have.io_limits != want.io_limits {
                out.set(
                    AttributeChange::DiskLimits {
                        interface: interface.clone(),
                        limits: want.io_limits.clone(),
                    },
                    false,
                );
            }
        }
    }

    Ok(out)
}
