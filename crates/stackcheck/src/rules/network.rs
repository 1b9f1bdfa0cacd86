use super::{Findings, Rule, RuleInput, Severity};
use crate::config::PortSpec;
use crate::expression::Expression;
use crate::resolver::Resolved;
use crate::template::NodeIndex;
use crate::util::FieldPath;

/// Ingress from the whole internet
///
/// - on a data-plane port (database, cache, ...): critical
/// - on a public port: fine for groups attached to a front door (or to nothing yet), medium
///   otherwise
/// - on any other port: high
pub struct NetworkExposure;

const ALL_PORTS: (i64, i64) = (0, 65535);

impl Rule for NetworkExposure {
    fn name(&self) -> &str {
        "network-exposure"
    }

    fn message(&self) -> &str {
        "ingress rule of `{resource}` {detail}"
    }

    fn check(&self, input: &RuleInput<'_>, index: NodeIndex, findings: &mut Findings) {
        let Some(ingress) = input.spec(index).and_then(|spec| spec.ingress.as_ref()) else {
            return;
        };
        let resolved = input.resolved(index);

        let mut entries = vec![];
        if let Some(rules_property) = &ingress.rules_property {
            let base = FieldPath::root(rules_property.as_str());
            match resolved.property(&base) {
                Some(Resolved::Literal(crate::value::Value::Array(items))) => {
                    for (position, item) in items.into_iter().enumerate() {
                        entries.push((base.index(position), Resolved::Literal(item)));
                    }
                }
                Some(Resolved::List(items)) => {
                    for (position, item) in items.into_iter().enumerate() {
                        entries.push((base.index(position), item));
                    }
                }
                _ => {}
            }
        }
        if ingress.group_property.is_some() {
            entries.push((FieldPath::default(), Resolved::map(resolved.properties.clone())));
        }

        for (base, entry) in entries {
            self.check_entry(input, index, &base, &entry, findings);
        }
    }
}

impl NetworkExposure {
    fn check_entry(
        &self,
        input: &RuleInput<'_>,
        index: NodeIndex,
        base: &FieldPath,
        entry: &Resolved,
        findings: &mut Findings,
    ) {
        let field = |name: &str| entry.get(&FieldPath::root(name));
        let literal_text = |name: &str| field(name)?.into_literal()?.to_text();

        let Some((cidr_property, cidr)) = input
            .config
            .network
            .cidr_properties
            .iter()
            .find_map(|property| literal_text(property.as_str()).map(|cidr| (property, cidr)))
        else {
            return;
        };
        let Ok(network) = cidr.trim().parse::<ipnet::IpNet>() else {
            return;
        };
        if network.prefix_len() != 0 {
            return;
        }
        let path = base.key(cidr_property.as_str());

        let protocol = literal_text("IpProtocol").unwrap_or_else(|| "tcp".to_string());
        let (from, to) = match protocol.to_lowercase().as_str() {
            "-1" | "all" => ALL_PORTS,
            "icmp" | "icmpv6" | "1" | "58" => return,
            _ => {
                let port = |name: &str| field(name)?.into_literal()?.as_i64();
                match (port("FromPort"), port("ToPort")) {
                    (Some(-1), _) | (_, Some(-1)) => ALL_PORTS,
                    (Some(from), Some(to)) => (from, to),
                    (Some(port), None) | (None, Some(port)) => (port, port),
                    // ports only known after deployment
                    (None, None) => return,
                }
            }
        };

        let exposed = input
            .config
            .network
            .data_plane_ports
            .iter()
            .filter(|spec| (from..=to).contains(&i64::from(spec.port)))
            .collect::<Vec<&PortSpec>>();

        if !exposed.is_empty() {
            let ports = exposed
                .iter()
                .map(|spec| format!("{} ({})", spec.port, spec.protocol))
                .collect::<Vec<_>>()
                .join(", ");
            findings.violation(
                Severity::Critical,
                format!("allows {cidr} on data-plane port {ports}"),
                Some(&path),
            );
            return;
        }

        let is_public = from == to
            && input
                .config
                .network
                .public_ports
                .iter()
                .any(|port| i64::from(*port) == from);

        if !is_public {
            let ports = if from == to {
                from.to_string()
            } else {
                format!("{from}-{to}")
            };
            findings.violation(Severity::High, format!("allows {cidr} on port {ports}"), Some(&path));
            return;
        }

        let Some(group) = self.group_of(input, index) else {
            return;
        };
        let attached = input
            .graph
            .dependents(group)
            .filter(|dependent| {
                !input
                    .spec(*dependent)
                    .is_some_and(|spec| spec.ingress.is_some())
            })
            .collect::<Vec<_>>();

        if attached.is_empty() {
            tracing::debug!(resource = %input.node(index).id, "public port on an unattached group");
            return;
        }
        if attached
            .iter()
            .any(|dependent| input.spec(*dependent).is_some_and(|spec| spec.front_door))
        {
            return;
        }

        findings.violation(
            Severity::Medium,
            format!(
                "allows {cidr} on public port {from} but `{}` is not attached to a front door",
                input.node(group).id
            ),
            Some(&path),
        );
    }

    /// The group a rule belongs to: the resource itself, or the group a standalone rule names
    fn group_of(&self, input: &RuleInput<'_>, index: NodeIndex) -> Option<NodeIndex> {
        let ingress = input.spec(index)?.ingress.as_ref()?;
        let Some(group_property) = &ingress.group_property else {
            return Some(index);
        };

        match input.node(index).properties.get(group_property)?.as_expression()? {
            Expression::Reference(target) | Expression::Attribute { target, .. } => {
                input.template.index_of(target)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use crate::rules::test::{ephemeral, evaluate};
    use crate::rules::Severity;
    use crate::template::Template;
    use pretty_assertions::assert_eq;

    fn exposure(yaml: &str) -> Vec<(String, Severity, Option<String>)> {
        let template = Template::from_yaml_str(yaml).unwrap();
        evaluate(&template, &ephemeral())
            .violations
            .into_iter()
            .filter(|v| v.rule == "network-exposure")
            .map(|v| (v.resource, v.severity, v.path))
            .collect()
    }

    #[test]
    fn database_port_open_to_the_world() {
        let found = exposure(
            r#"
Resources:
  DbGroup:
    Type: AWS::EC2::SecurityGroup
    Properties:
      SecurityGroupIngress:
        - IpProtocol: tcp
          FromPort: 5432
          ToPort: 5432
          CidrIp: 0.0.0.0/0
        - IpProtocol: tcp
          FromPort: 5432
          ToPort: 5432
          CidrIp: 10.0.0.0/8
"#,
        );
        assert_eq!(
            found,
            vec![(
                "DbGroup".to_string(),
                Severity::Critical,
                Some("SecurityGroupIngress.0.CidrIp".to_string())
            )]
        );
    }

    #[test]
    fn web_port_depends_on_attachment() {
        let found = exposure(
            r#"
Resources:
  WebGroup:
    Type: AWS::EC2::SecurityGroup
    Properties:
      SecurityGroupIngress:
        - { IpProtocol: tcp, FromPort: 443, ToPort: 443, CidrIp: 0.0.0.0/0 }
  Balancer:
    Type: AWS::ElasticLoadBalancingV2::LoadBalancer
    Properties:
      Name: web-qa17
      SecurityGroups: [!GetAtt WebGroup.GroupId]
  HostGroup:
    Type: AWS::EC2::SecurityGroup
    Properties:
      SecurityGroupIngress:
        - { IpProtocol: tcp, FromPort: 443, ToPort: 443, CidrIpv6: "::/0" }
  Host:
    Type: AWS::EC2::Instance
    Properties:
      SecurityGroupIds: [!Ref HostGroup]
  SpareGroup:
    Type: AWS::EC2::SecurityGroup
    Properties:
      SecurityGroupIngress:
        - { IpProtocol: tcp, FromPort: 80, ToPort: 80, CidrIp: 0.0.0.0/0 }
"#,
        );
        assert_eq!(
            found,
            vec![(
                "HostGroup".to_string(),
                Severity::Medium,
                Some("SecurityGroupIngress.0.CidrIpv6".to_string())
            )]
        );
    }

    #[test]
    fn other_ports_and_all_traffic() {
        let found = exposure(
            r#"
Resources:
  Ssh:
    Type: AWS::EC2::SecurityGroup
    Properties:
      SecurityGroupIngress:
        - { IpProtocol: tcp, FromPort: 22, ToPort: 22, CidrIp: 0.0.0.0/0 }
        - { IpProtocol: icmp, FromPort: -1, ToPort: -1, CidrIp: 0.0.0.0/0 }
  Everything:
    Type: AWS::EC2::SecurityGroup
    Properties:
      SecurityGroupIngress:
        - { IpProtocol: "-1", CidrIp: 0.0.0.0/0 }
"#,
        );
        assert_eq!(
            found
                .iter()
                .map(|(id, severity, _)| (id.as_str(), *severity))
                .collect::<Vec<_>>(),
            vec![("Everything", Severity::Critical), ("Ssh", Severity::High)]
        );
    }

    #[test]
    fn standalone_ingress_resource() {
        let template = Template::from_yaml_str(
            r#"
Resources:
  CacheGroup:
    Type: AWS::EC2::SecurityGroup
  CacheIngress:
    Type: AWS::EC2::SecurityGroupIngress
    Properties:
      GroupId: !GetAtt CacheGroup.GroupId
      IpProtocol: tcp
      FromPort: "6379"
      ToPort: "6379"
      CidrIp: 0.0.0.0/0
"#,
        )
        .unwrap();
        let evaluation = evaluate(&template, &ephemeral());
        let violation = evaluation
            .violations
            .iter()
            .find(|v| v.rule == "network-exposure")
            .unwrap();

        assert_eq!(violation.resource, "CacheIngress");
        assert_eq!(violation.severity, Severity::Critical);
        assert_eq!(violation.path.as_deref(), Some("CidrIp"));
        assert_eq!(
            violation.message,
            "ingress rule of `CacheIngress` allows 0.0.0.0/0 on data-plane port 6379 (redis)"
        );
    }
}
